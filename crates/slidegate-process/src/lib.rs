use std::{fmt, path::PathBuf};

const MAX_RESOURCE_ID_LEN: usize = 128;

/// Opaque identifier of the slide project a preview belongs to.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id can be used as a single path segment (no separators,
    /// no `.`/`..`, bounded length).
    pub fn is_path_safe(&self) -> bool {
        let s = self.0.as_str();
        !s.is_empty()
            && s.len() <= MAX_RESOURCE_ID_LEN
            && s != "."
            && s != ".."
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PreviewState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PreviewStatus {
    pub resource_id: ResourceId,
    pub project_path: PathBuf,
    pub port: u16,
    pub state: PreviewState,
    pub pid: Option<u32>,
    pub started_at_unix_ms: u64,
    pub last_accessed_at_unix_ms: u64,
    pub message: Option<String>,
}
