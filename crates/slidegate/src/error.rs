use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 1024;

/// Failures of the preview subsystem. Every variant is scoped to a single
/// resource id; none of them is fatal to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreviewError {
    #[error("preview project not found: {0}")]
    NotFound(String),
    #[error("no preview capacity left: {0}")]
    PoolExhausted(String),
    #[error("preview failed to start: {0}")]
    StartupFailed(String),
    #[error("preview upstream unreachable: {0}")]
    UpstreamUnreachable(String),
}

impl PreviewError {
    pub fn code(&self) -> &'static str {
        match self {
            PreviewError::NotFound(_) => "not_found",
            PreviewError::PoolExhausted(_) => "pool_exhausted",
            PreviewError::StartupFailed(_) => "startup_failed",
            PreviewError::UpstreamUnreachable(_) => "upstream_unreachable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PreviewError::NotFound(_) => StatusCode::NOT_FOUND,
            PreviewError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            PreviewError::StartupFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PreviewError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            PreviewError::NotFound(_) => None,
            PreviewError::PoolExhausted(_) => {
                Some("Retry later; idle previews are reclaimed periodically.")
            }
            PreviewError::StartupFailed(_) => {
                Some("Check the gateway logs for the dev server output of this resource.")
            }
            PreviewError::UpstreamUnreachable(_) => {
                Some("The preview was restarted; reload the page.")
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let payload = ErrorPayload {
            code: self.code().to_string(),
            message: truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        };
        (self.status(), Json(payload)).into_response()
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
