use std::{borrow::Cow, io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{
        ConnectInfo, FromRequestParts, Request,
        ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, header, request::Parts},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use slidegate_process::ResourceId;
use tokio::{net::TcpStream, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self,
        Message as UpstreamMessage,
        client::IntoClientRequest,
        protocol::{CloseFrame as UpstreamCloseFrame, frame::coding::CloseCode},
    },
};
use tracing::Instrument;

use crate::error::PreviewError;
use crate::request_meta::{REQUEST_ID_HEADER, RequestMeta};
use crate::resolver::ProjectResolver;
use crate::supervisor::ProcessSupervisor;

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Regenerated by the upstream handshake.
const WS_HANDSHAKE: [&str; 4] = [
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum ForwardFailure {
    /// Nothing listens on the instance port anymore.
    Refused(String),
    /// Any other transport failure.
    Broken(String),
}

impl ForwardFailure {
    fn message(&self) -> &str {
        match self {
            ForwardFailure::Refused(m) | ForwardFailure::Broken(m) => m,
        }
    }
}

fn classify_http(err: reqwest::Error) -> ForwardFailure {
    let msg = format!("upstream request failed: {err}");
    if err.is_connect() {
        ForwardFailure::Refused(msg)
    } else {
        ForwardFailure::Broken(msg)
    }
}

fn classify_ws(err: tungstenite::Error) -> ForwardFailure {
    let msg = format!("upstream websocket handshake failed: {err}");
    match &err {
        tungstenite::Error::Io(io) if io.kind() == ErrorKind::ConnectionRefused => {
            ForwardFailure::Refused(msg)
        }
        _ => ForwardFailure::Broken(msg),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Hop-by-hop headers, plus whatever the `Connection` header nominates.
fn is_hop_by_hop(name: &HeaderName, headers: &HeaderMap) -> bool {
    if HOP_BY_HOP.contains(&name.as_str()) {
        return true;
    }
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case(name.as_str()))
}

fn strip_hop_by_hop(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if !is_hop_by_hop(name, src) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Headers sent to the dev server: end-to-end headers of the client
/// request, `Host` rewritten to the instance, `X-Forwarded-*` appended and
/// the gateway's request id passed along.
fn upstream_headers(parts: &Parts, port: u16) -> HeaderMap {
    let mut out = strip_hop_by_hop(&parts.headers);
    out.remove(header::HOST);

    if let Ok(host) = HeaderValue::from_str(&format!("localhost:{port}")) {
        out.insert(header::HOST, host);
    }

    if let Some(meta) = parts.extensions.get::<RequestMeta>() {
        if let Ok(v) = HeaderValue::from_str(&meta.request_id) {
            out.insert(HeaderName::from_static(REQUEST_ID_HEADER), v);
        }
    }

    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    if let Some(ip) = client_ip {
        let chain = match out.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prev) if !prev.trim().is_empty() => format!("{prev}, {ip}"),
            _ => ip,
        };
        if let Ok(v) = HeaderValue::from_str(&chain) {
            out.insert(HeaderName::from_static("x-forwarded-for"), v);
        }
    }

    if !out.contains_key("x-forwarded-host") {
        if let Some(host) = parts.headers.get(header::HOST) {
            out.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }
    }
    if !out.contains_key("x-forwarded-proto") {
        out.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("http"),
        );
    }
    out
}

fn has_request_body(headers: &HeaderMap) -> bool {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match declared_len {
        Some(len) => len > 0,
        None => headers.contains_key(header::TRANSFER_ENCODING),
    }
}

/// Routes preview traffic for a resource id to its dev server, starting the
/// server on first use.
#[derive(Clone)]
pub struct ProxyGateway {
    supervisor: ProcessSupervisor,
    resolver: Arc<dyn ProjectResolver>,
    client: reqwest::Client,
}

impl ProxyGateway {
    pub fn new(
        supervisor: ProcessSupervisor,
        resolver: Arc<dyn ProjectResolver>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build upstream http client")?;
        Ok(Self {
            supervisor,
            resolver,
            client,
        })
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Resolves the project for `id` and returns the port of a ready
    /// instance serving it.
    pub async fn resolve_port(&self, id: &ResourceId) -> Result<u16, PreviewError> {
        let project_path = self.resolver.resolve(id).await?;
        self.supervisor.ensure_running(id, &project_path).await
    }

    /// Forwards one client request (plain HTTP or a websocket upgrade) to
    /// the instance for `id`. Never panics; every failure becomes a JSON
    /// error response.
    pub async fn forward(&self, id: ResourceId, req: Request) -> Response {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let port = match self.resolve_port(&id).await {
            Ok(port) => port,
            Err(err) => {
                tracing::warn!(
                    resource_id = %id,
                    %method,
                    path = %path,
                    code = err.code(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "preview unavailable"
                );
                return err.into_response();
            }
        };

        let result = if is_websocket_upgrade(req.headers()) {
            self.forward_ws(&id, port, req).await
        } else {
            self.forward_http(port, req).await
        };

        match result {
            Ok(resp) => {
                tracing::info!(
                    resource_id = %id,
                    %method,
                    path = %path,
                    port,
                    status = resp.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "proxied"
                );
                resp
            }
            Err(failure) => {
                tracing::warn!(
                    resource_id = %id,
                    %method,
                    path = %path,
                    port,
                    error = failure.message(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upstream unreachable"
                );
                if let ForwardFailure::Refused(_) = failure {
                    // Teardown can take the whole stop grace; the client gets
                    // its 502 now and the next request a fresh instance.
                    let supervisor = self.supervisor.clone();
                    let span =
                        tracing::info_span!("preview_unreachable", resource_id = %id, port);
                    tokio::spawn(
                        async move {
                            supervisor.mark_unreachable(&id, port).await;
                        }
                        .instrument(span),
                    );
                }
                PreviewError::UpstreamUnreachable(failure.message().to_string()).into_response()
            }
        }
    }

    async fn forward_http(&self, port: u16, req: Request) -> Result<Response, ForwardFailure> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://127.0.0.1:{port}{path_and_query}");

        let mut upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(upstream_headers(&parts, port));
        if has_request_body(&parts.headers) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let resp = upstream.send().await.map_err(classify_http)?;

        let status = resp.status();
        let headers = strip_hop_by_hop(resp.headers());
        let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }

    async fn forward_ws(
        &self,
        id: &ResourceId,
        port: u16,
        req: Request,
    ) -> Result<Response, ForwardFailure> {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return Ok(rejection.into_response()),
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut upstream_req = format!("ws://127.0.0.1:{port}{path_and_query}")
            .into_client_request()
            .map_err(|e| ForwardFailure::Broken(format!("invalid upstream websocket url: {e}")))?;
        let forwarded = upstream_headers(&parts, port);
        let target = upstream_req.headers_mut();
        for name in forwarded.keys() {
            if !WS_HANDSHAKE.contains(&name.as_str()) {
                target.remove(name);
            }
        }
        for (name, value) in &forwarded {
            if !WS_HANDSHAKE.contains(&name.as_str()) {
                target.append(name.clone(), value.clone());
            }
        }

        // Connect before accepting the client so a dead upstream surfaces as
        // a 502 instead of a socket that closes right away.
        let (upstream, handshake) =
            tokio::time::timeout(WS_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(upstream_req))
                .await
                .map_err(|_| {
                    ForwardFailure::Broken(format!(
                        "upstream websocket handshake timed out after {}s",
                        WS_CONNECT_TIMEOUT.as_secs()
                    ))
                })?
                .map_err(classify_ws)?;

        let mut ws = ws;
        if let Some(proto) = handshake
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
        {
            ws = ws.protocols([proto.to_string()]);
        }

        let supervisor = self.supervisor.clone();
        let span = tracing::info_span!("preview_ws", resource_id = %id, port);
        let id = id.clone();
        Ok(ws
            .on_upgrade(move |socket| relay(socket, upstream, supervisor, id).instrument(span))
            .into_response())
    }
}

fn to_upstream(msg: ClientMessage) -> Option<UpstreamMessage> {
    match msg {
        ClientMessage::Text(t) => Some(UpstreamMessage::Text(t.into())),
        ClientMessage::Binary(b) => Some(UpstreamMessage::Binary(b.into())),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.into_owned().into(),
            }
        }))),
        ClientMessage::Ping(p) => Some(UpstreamMessage::Ping(p.into())),
        ClientMessage::Pong(p) => Some(UpstreamMessage::Pong(p.into())),
    }
}

fn to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(t) => Some(ClientMessage::Text(t.as_str().to_owned())),
        UpstreamMessage::Binary(b) => Some(ClientMessage::Binary(b.to_vec())),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| {
            ClientCloseFrame {
                code: u16::from(f.code),
                reason: Cow::Owned(f.reason.as_str().to_owned()),
            }
        }))),
        UpstreamMessage::Ping(p) => Some(ClientMessage::Ping(p.to_vec())),
        UpstreamMessage::Pong(p) => Some(ClientMessage::Pong(p.to_vec())),
        // Raw frames never surface from a reading socket.
        UpstreamMessage::Frame(_) => None,
    }
}

async fn relay(
    client: WebSocket,
    upstream: UpstreamSocket,
    supervisor: ProcessSupervisor,
    id: ResourceId,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    tracing::debug!("websocket relay open");

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, ClientMessage::Close(_));
            if let Some(msg) = to_upstream(msg) {
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
            supervisor.touch(&id).await;
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let closing = matches!(msg, UpstreamMessage::Close(_));
            if let Some(msg) = to_client(msg) {
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    tracing::debug!("websocket relay closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut h = HeaderMap::new();
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert("x-private", HeaderValue::from_static("1"));
        h.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        h.append(header::COOKIE, HeaderValue::from_static("a=1"));
        h.append(header::COOKIE, HeaderValue::from_static("b=2"));

        let out = strip_hop_by_hop(&h);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get(header::ACCEPT).unwrap(), "text/html");
        assert_eq!(out.get_all(header::COOKIE).iter().count(), 2);
        assert!(!out.contains_key("x-private"));
    }

    #[test]
    fn forwarded_headers_are_appended() {
        let req = axum::http::Request::builder()
            .uri("/api/slides/preview/42/?x=1")
            .header(header::HOST, "gateway.example:3001")
            .header("x-forwarded-for", "10.0.0.1")
            .header(header::UPGRADE, "websocket")
            .extension(ConnectInfo(SocketAddr::from(([192, 168, 1, 9], 5555))))
            .extension(RequestMeta {
                request_id: "req-77".to_string(),
            })
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();

        let out = upstream_headers(&parts, 31007);
        assert_eq!(out.get(header::HOST).unwrap(), "localhost:31007");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.1, 192.168.1.9");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "gateway.example:3001");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(out.get(REQUEST_ID_HEADER).unwrap(), "req-77");
        assert!(!out.contains_key(header::UPGRADE));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut h = HeaderMap::new();
        assert!(!is_websocket_upgrade(&h));
        h.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&h));
        h.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&h));
    }

    #[test]
    fn request_body_detection() {
        let mut h = HeaderMap::new();
        assert!(!has_request_body(&h));
        h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!has_request_body(&h));
        h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(has_request_body(&h));
        let mut chunked = HeaderMap::new();
        chunked.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(has_request_body(&chunked));
    }

    #[test]
    fn close_frames_survive_translation() {
        let up = to_upstream(ClientMessage::Close(Some(ClientCloseFrame {
            code: 4001,
            reason: Cow::Borrowed("bye"),
        })))
        .unwrap();
        let back = to_client(up).unwrap();
        match back {
            ClientMessage::Close(Some(f)) => {
                assert_eq!(f.code, 4001);
                assert_eq!(f.reason, "bye");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            to_client(UpstreamMessage::Ping(vec![7u8].into())),
            Some(ClientMessage::Ping(vec![7]))
        );
    }
}
