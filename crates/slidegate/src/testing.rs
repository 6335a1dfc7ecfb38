//! In-process stand-ins for dev servers, shared by the unit tests.

use std::{
    borrow::Cow,
    future::IntoFuture,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        FromRequestParts, Request, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::launcher::{LaunchSpec, LaunchedProcess, Launcher, ProcessControl};
use crate::port_alloc::PortAllocator;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

pub(crate) const ECHO_SUBPROTOCOL: &str = "vite-hmr";

/// Upgrades on a path ending in this segment get one unsolicited text frame,
/// then a close with [`PUSH_CLOSE_CODE`].
pub(crate) const PUSH_PATH: &str = "__push";
pub(crate) const PUSH_CLOSE_CODE: u16 = 4000;
pub(crate) const PUSH_FRAME: &str = "hmr: full-reload";

// Close codes the echo upstream received from its peers.
type CloseLog = Arc<Mutex<Vec<u16>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeBehavior {
    /// Binds the leased port and serves [`echo_router`].
    Serve,
    /// Stays alive without ever listening.
    NeverReady,
    /// Exits with code 1 right after launch.
    ExitImmediately,
    /// `launch` itself fails.
    SpawnError,
}

#[derive(Clone)]
pub(crate) struct FakeLauncher {
    behavior: Arc<Mutex<FakeBehavior>>,
    ready_delay: Duration,
    ignore_terminate: bool,
    launches: Arc<AtomicUsize>,
    next_pid: Arc<AtomicU32>,
    last: Arc<Mutex<Option<FakeProcess>>>,
}

impl FakeLauncher {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            ready_delay: Duration::ZERO,
            ignore_terminate: false,
            launches: Arc::new(AtomicUsize::new(0)),
            next_pid: Arc::new(AtomicU32::new(40_000)),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Processes only go down on SIGKILL.
    pub(crate) fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn last_process(&self) -> Option<FakeProcess> {
        self.last.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        if behavior == FakeBehavior::SpawnError {
            anyhow::bail!("fake spawn failure for {}", spec.resource_id);
        }

        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let (serving_tx, serving_rx) = watch::channel(true);
        let process = FakeProcess {
            exit_tx: Arc::new(exit_tx),
            serving_tx: Arc::new(serving_tx),
            ignore_terminate: self.ignore_terminate,
            terminations: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
            closes: CloseLog::default(),
        };
        *self.last.lock().unwrap() = Some(process.clone());

        let server = match behavior {
            FakeBehavior::Serve => Some(tokio::spawn(serve_until_exit(
                spec.port,
                self.ready_delay,
                exit_rx.clone(),
                serving_rx,
                process.closes.clone(),
            ))),
            _ => None,
        };

        let exited: BoxFuture<'static, Option<i32>> = match behavior {
            FakeBehavior::ExitImmediately => {
                process.exit_tx.send_replace(Some(1));
                Box::pin(async { Some(1) })
            }
            _ => {
                let mut exit_rx = exit_rx;
                Box::pin(async move {
                    let code = match exit_rx.wait_for(|c| c.is_some()).await {
                        Ok(code) => *code,
                        Err(_) => None,
                    };
                    if let Some(server) = server {
                        let _ = server.await;
                    }
                    code
                })
            }
        };

        Ok(LaunchedProcess {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            control: Arc::new(process),
            exited,
        })
    }
}

async fn serve_until_exit(
    port: u16,
    ready_delay: Duration,
    mut exit_rx: watch::Receiver<Option<i32>>,
    mut serving_rx: watch::Receiver<bool>,
    closes: CloseLog,
) {
    tokio::select! {
        _ = tokio::time::sleep(ready_delay) => {}
        _ = exit_rx.wait_for(|c| c.is_some()) => return,
    }

    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
        Ok(l) => l,
        Err(_) => return,
    };
    let server = axum::serve(listener, echo_router(closes)).into_future();
    tokio::select! {
        _ = server => {}
        _ = exit_rx.wait_for(|c| c.is_some()) => {}
        _ = serving_rx.wait_for(|serving| !*serving) => {}
    }
}

#[derive(Clone)]
pub(crate) struct FakeProcess {
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    serving_tx: Arc<watch::Sender<bool>>,
    ignore_terminate: bool,
    terminations: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    closes: CloseLog,
}

impl FakeProcess {
    fn exit_with(&self, code: i32) {
        self.exit_tx.send_if_modified(|c| {
            if c.is_none() {
                *c = Some(code);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn crash(&self) {
        self.exit_with(1);
    }

    /// Closes the listener while the process stays alive.
    pub(crate) fn stop_serving(&self) {
        self.serving_tx.send_replace(false);
    }

    pub(crate) fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub(crate) fn close_codes(&self) -> Vec<u16> {
        self.closes.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcess {
    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.exit_with(0);
        }
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit_with(137);
    }
}

/// Echoes each request back as JSON; websocket upgrades get a text echo.
/// An `x-echo-status` request header overrides the response status.
fn echo_router(closes: CloseLog) -> Router {
    Router::new().fallback(echo).with_state(closes)
}

async fn echo(State(closes): State<CloseLog>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();

    if parts.headers.contains_key(header::UPGRADE) {
        let push = parts.uri.path().trim_end_matches('/').ends_with(PUSH_PATH);
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) if push => ws.protocols([ECHO_SUBPROTOCOL]).on_upgrade(push_then_close),
            Ok(ws) => ws
                .protocols([ECHO_SUBPROTOCOL])
                .on_upgrade(move |socket| echo_socket(socket, closes)),
            Err(rejection) => rejection.into_response(),
        };
    }

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let mut headers = serde_json::Map::new();
    for name in parts.headers.keys() {
        let joined = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(name.to_string(), serde_json::Value::String(joined));
    }

    let status = parts
        .headers
        .get("x-echo-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| StatusCode::from_u16(v).ok())
        .unwrap_or(StatusCode::OK);

    let payload = serde_json::json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    (
        status,
        [
            (HeaderName::from_static("x-upstream"), "echo"),
            (header::SET_COOKIE, "session=abc"),
        ],
        Json(payload),
    )
        .into_response()
}

async fn echo_socket(mut socket: WebSocket, closes: CloseLog) {
    while let Some(Ok(msg)) = socket.recv().await {
        let reply = match msg {
            Message::Text(t) => Message::Text(format!("echo: {t}")),
            Message::Binary(b) => Message::Binary(b),
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    closes.lock().unwrap().push(frame.code);
                }
                break;
            }
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

// Sends without being asked, the way a dev server pushes a reload.
async fn push_then_close(mut socket: WebSocket) {
    if socket
        .send(Message::Text(PUSH_FRAME.to_string()))
        .await
        .is_err()
    {
        return;
    }
    let close = Message::Close(Some(CloseFrame {
        code: PUSH_CLOSE_CODE,
        reason: Cow::Borrowed("reload"),
    }));
    if socket.send(close).await.is_err() {
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

/// Supervisor over `base..=base + 9` with short timeouts. Each test uses its
/// own port block so tests can run in parallel.
pub(crate) fn test_supervisor(launcher: &FakeLauncher, base: u16) -> ProcessSupervisor {
    supervisor_with_grace(launcher, base, Duration::from_millis(200))
}

pub(crate) fn supervisor_with_grace(
    launcher: &FakeLauncher,
    base: u16,
    stop_grace: Duration,
) -> ProcessSupervisor {
    ProcessSupervisor::new(
        PortAllocator::new(base..=base + 9, true),
        Arc::new(launcher.clone()),
        SupervisorConfig {
            ready_timeout: Duration::from_secs(3),
            stop_grace,
            max_instances: None,
        },
    )
}
