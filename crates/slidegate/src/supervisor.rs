use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::future::{BoxFuture, join_all};
use slidegate_process::{PreviewState, PreviewStatus, ResourceId};
use tokio::{
    sync::{Mutex, watch},
    time::Instant,
};
use tracing::Instrument;

use crate::error::{PreviewError, format_error_chain};
use crate::launcher::{LaunchSpec, LaunchedProcess, Launcher, ProcessControl};
use crate::port_alloc::PortAllocator;

// After SIGKILL the kernel reaps quickly; this only bounds a wedged wait.
const KILL_WAIT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

type StartOutcome = Option<Result<u16, PreviewError>>;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
    pub max_instances: Option<usize>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            max_instances: None,
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(s);
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

async fn await_outcome(mut rx: watch::Receiver<StartOutcome>) -> Result<u16, PreviewError> {
    let outcome = match rx.wait_for(|o| o.is_some()).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| {
        Err(PreviewError::StartupFailed(
            "start task ended without an outcome".to_string(),
        ))
    })
}

/// Returns `true` once the instance has exited (or its watcher is gone).
async fn wait_exited(mut rx: watch::Receiver<bool>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        let _ = rx.wait_for(|exited| *exited).await;
    })
    .await
    .is_ok()
}

struct PreviewEntry {
    // Distinguishes successive instances of the same resource id, so late
    // events from an old instance never touch its replacement.
    generation: u64,
    project_path: PathBuf,
    port: u16,
    state: PreviewState,
    pid: Option<u32>,
    started_at_unix_ms: u64,
    last_accessed_at: Instant,
    stopping: bool,
    message: Option<String>,
    control: Option<Arc<dyn ProcessControl>>,
    outcome: watch::Receiver<StartOutcome>,
    exited: watch::Receiver<bool>,
}

impl PreviewEntry {
    fn snapshot(&self, id: &ResourceId) -> PreviewStatus {
        let idle_ms = self.last_accessed_at.elapsed().as_millis() as u64;
        PreviewStatus {
            resource_id: id.clone(),
            project_path: self.project_path.clone(),
            port: self.port,
            state: self.state,
            pid: self.pid,
            started_at_unix_ms: self.started_at_unix_ms,
            last_accessed_at_unix_ms: now_unix_ms().saturating_sub(idle_ms),
            message: self.message.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<ResourceId, PreviewEntry>,
    next_generation: u64,
}

enum Pending {
    Vacant,
    Start(watch::Receiver<StartOutcome>),
    Exit(watch::Receiver<bool>),
}

enum StopStep {
    AwaitStart(watch::Receiver<StartOutcome>),
    AwaitExit(watch::Receiver<bool>),
    Terminate {
        control: Option<Arc<dyn ProcessControl>>,
        exited: watch::Receiver<bool>,
        port: u16,
        pid: Option<u32>,
    },
}

enum Probe {
    Ready,
    TimedOut,
    Exited,
}

/// Owns every live preview instance. At most one instance (and one start
/// attempt) exists per resource id; the registry lock is only held for
/// short state transitions, never across spawning, probing or teardown.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<Registry>>,
    ports: PortAllocator,
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(ports: PortAllocator, launcher: Arc<dyn Launcher>, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            ports,
            launcher,
            config,
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Returns the port of a ready instance for `id`, starting one if needed.
    /// Concurrent callers for the same id share a single start attempt and
    /// all observe its outcome.
    pub async fn ensure_running(
        &self,
        id: &ResourceId,
        project_path: &Path,
    ) -> Result<u16, PreviewError> {
        loop {
            let pending = {
                let mut reg = self.inner.lock().await;
                match reg.entries.get_mut(id) {
                    Some(e) if e.stopping => Pending::Exit(e.exited.clone()),
                    Some(e) if e.state == PreviewState::Ready => {
                        e.last_accessed_at = Instant::now();
                        return Ok(e.port);
                    }
                    Some(e) => Pending::Start(e.outcome.clone()),
                    None => {
                        self.check_capacity(&reg)?;
                        Pending::Vacant
                    }
                }
            };

            match pending {
                Pending::Vacant => {
                    // The OS probe binds sockets, so it runs without the
                    // registry lock held.
                    let port = self.ports.allocate()?;
                    let rx = {
                        let mut reg = self.inner.lock().await;
                        if reg.entries.contains_key(id) {
                            // Another caller got there first; join its attempt.
                            self.ports.release(port);
                            continue;
                        }
                        if let Err(err) = self.check_capacity(&reg) {
                            self.ports.release(port);
                            return Err(err);
                        }
                        self.begin_start(&mut reg, id, project_path, port)
                    };
                    return await_outcome(rx).await;
                }
                Pending::Start(rx) => return await_outcome(rx).await,
                Pending::Exit(rx) => {
                    // A teardown is in flight; wait for it, then start fresh.
                    if !wait_exited(rx, self.config.stop_grace + KILL_WAIT).await {
                        return Err(PreviewError::StartupFailed(format!(
                            "previous instance of {id} is still shutting down"
                        )));
                    }
                }
            }
        }
    }

    fn check_capacity(&self, reg: &Registry) -> Result<(), PreviewError> {
        if let Some(max) = self.config.max_instances {
            if reg.entries.len() >= max {
                return Err(PreviewError::PoolExhausted(format!(
                    "instance limit reached ({max})"
                )));
            }
        }
        Ok(())
    }

    // Runs under the registry lock: nothing here may block.
    fn begin_start(
        &self,
        reg: &mut Registry,
        id: &ResourceId,
        project_path: &Path,
        port: u16,
    ) -> watch::Receiver<StartOutcome> {
        reg.next_generation = reg.next_generation.saturating_add(1);
        let generation = reg.next_generation;

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (exited_tx, exited_rx) = watch::channel(false);
        reg.entries.insert(
            id.clone(),
            PreviewEntry {
                generation,
                project_path: project_path.to_path_buf(),
                port,
                state: PreviewState::Starting,
                pid: None,
                started_at_unix_ms: now_unix_ms(),
                last_accessed_at: Instant::now(),
                stopping: false,
                message: Some(format!("waiting for port {port}...")),
                control: None,
                outcome: outcome_rx.clone(),
                exited: exited_rx,
            },
        );

        tracing::info!(resource_id = %id, port, generation, "preview instance starting");

        let span = tracing::info_span!("preview_start", resource_id = %id, port, generation);
        tokio::spawn(
            self.clone()
                .run_start(
                    id.clone(),
                    generation,
                    port,
                    project_path.to_path_buf(),
                    outcome_tx,
                    exited_tx,
                )
                .instrument(span),
        );

        outcome_rx
    }

    // Detached from the caller so a dropped request never abandons a spawn
    // half way.
    async fn run_start(
        self,
        id: ResourceId,
        generation: u64,
        port: u16,
        project_path: PathBuf,
        outcome_tx: watch::Sender<StartOutcome>,
        exited_tx: watch::Sender<bool>,
    ) {
        let started = Instant::now();
        let spec = LaunchSpec {
            resource_id: id.clone(),
            entry: project_path,
            port,
        };

        let LaunchedProcess {
            pid,
            control,
            exited,
        } = match self.launcher.launch(&spec) {
            Ok(v) => v,
            Err(err) => {
                let msg = format_error_chain(&err);
                tracing::warn!(error = %msg, "dev server spawn failed");
                self.retire(&id, generation, PreviewState::Failed, &msg).await;
                // Nothing was spawned, so the port is free right away.
                self.ports.release(port);
                exited_tx.send_replace(true);
                outcome_tx.send_replace(Some(Err(PreviewError::StartupFailed(msg))));
                return;
            }
        };

        {
            let mut reg = self.inner.lock().await;
            if let Some(e) = reg.entries.get_mut(&id) {
                if e.generation == generation {
                    e.pid = pid;
                    e.control = Some(control.clone());
                }
            }
        }

        let mut exited_rx = exited_tx.subscribe();
        let span = tracing::info_span!("preview_exit", resource_id = %id, port, generation);
        tokio::spawn(
            self.clone()
                .watch_exit(id.clone(), generation, port, exited, exited_tx)
                .instrument(span),
        );

        let timeout = self.config.ready_timeout;
        let probe = tokio::select! {
            ok = wait_for_local_tcp_port(port, timeout) => {
                if ok { Probe::Ready } else { Probe::TimedOut }
            }
            _ = exited_rx.wait_for(|exited| *exited) => Probe::Exited,
        };

        match probe {
            Probe::Ready => {
                let promoted = {
                    let mut reg = self.inner.lock().await;
                    match reg.entries.get_mut(&id) {
                        Some(e)
                            if e.generation == generation && e.state == PreviewState::Starting =>
                        {
                            e.state = PreviewState::Ready;
                            e.last_accessed_at = Instant::now();
                            e.message = None;
                            true
                        }
                        _ => false,
                    }
                };

                if promoted {
                    tracing::info!(
                        ?pid,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "preview instance ready"
                    );
                    outcome_tx.send_replace(Some(Ok(port)));
                } else {
                    outcome_tx.send_replace(Some(Err(PreviewError::StartupFailed(format!(
                        "dev server on port {port} exited during startup"
                    )))));
                }
            }
            Probe::TimedOut | Probe::Exited => {
                let timed_out = matches!(probe, Probe::TimedOut);
                let msg = if timed_out {
                    format!(
                        "port {port} did not accept connections within {}ms",
                        timeout.as_millis()
                    )
                } else {
                    format!("dev server exited before accepting connections on port {port}")
                };
                tracing::warn!(error = %msg, "preview instance failed to start");

                self.retire(&id, generation, PreviewState::Failed, &msg).await;
                outcome_tx.send_replace(Some(Err(PreviewError::StartupFailed(msg))));

                // The port is released by the exit watcher once the process is gone.
                if timed_out {
                    self.terminate_and_reap(Some(control), exited_rx).await;
                }
            }
        }
    }

    async fn watch_exit(
        self,
        id: ResourceId,
        generation: u64,
        port: u16,
        exited: BoxFuture<'static, Option<i32>>,
        exited_tx: watch::Sender<bool>,
    ) {
        let exit_code = exited.await;

        // Entry first: a released port must never be reachable through it.
        let reason = format!("exited with code {exit_code:?}");
        let previous = self
            .retire(&id, generation, PreviewState::Stopped, &reason)
            .await;
        self.ports.release(port);

        match previous {
            Some((PreviewState::Ready, false)) => {
                tracing::warn!(?exit_code, "preview instance exited unexpectedly");
            }
            _ => tracing::info!(?exit_code, "dev server exited"),
        }

        exited_tx.send_replace(true);
    }

    /// Removes the entry for `id` if it still belongs to `generation`,
    /// returning its prior state and stopping flag.
    async fn retire(
        &self,
        id: &ResourceId,
        generation: u64,
        terminal: PreviewState,
        reason: &str,
    ) -> Option<(PreviewState, bool)> {
        let mut reg = self.inner.lock().await;
        let prior = match reg.entries.get(id) {
            Some(e) if e.generation == generation => (e.state, e.stopping),
            _ => return None,
        };
        reg.entries.remove(id);
        tracing::debug!(
            resource_id = %id,
            from = ?prior.0,
            to = ?terminal,
            reason,
            "preview state transition"
        );
        Some(prior)
    }

    /// SIGTERM, then SIGKILL once the grace period runs out. Returns after
    /// the process has exited (and its port has been released).
    async fn terminate_and_reap(
        &self,
        control: Option<Arc<dyn ProcessControl>>,
        exited: watch::Receiver<bool>,
    ) {
        let Some(control) = control else {
            wait_exited(exited, KILL_WAIT).await;
            return;
        };

        control.terminate();
        let grace = self.config.stop_grace;
        if wait_exited(exited.clone(), grace).await {
            return;
        }

        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "dev server ignored SIGTERM; sending SIGKILL"
        );
        control.kill();
        if !wait_exited(exited, KILL_WAIT).await {
            tracing::error!("dev server did not exit after SIGKILL");
        }
    }

    /// Stops the instance for `id` when `should_stop` holds for it. An
    /// in-flight start is always allowed to resolve first; the predicate is
    /// evaluated under the registry lock against the settled instance.
    async fn stop_matching<F>(&self, id: &ResourceId, should_stop: F) -> bool
    where
        F: Fn(&PreviewEntry) -> bool,
    {
        loop {
            let step = {
                let mut reg = self.inner.lock().await;
                let Some(e) = reg.entries.get_mut(id) else {
                    return false;
                };
                if e.state == PreviewState::Starting {
                    StopStep::AwaitStart(e.outcome.clone())
                } else if e.stopping {
                    StopStep::AwaitExit(e.exited.clone())
                } else if !should_stop(e) {
                    return false;
                } else {
                    e.stopping = true;
                    e.message = Some("stopping".to_string());
                    StopStep::Terminate {
                        control: e.control.clone(),
                        exited: e.exited.clone(),
                        port: e.port,
                        pid: e.pid,
                    }
                }
            };

            match step {
                StopStep::AwaitStart(rx) => {
                    let _ = await_outcome(rx).await;
                }
                StopStep::AwaitExit(rx) => {
                    wait_exited(rx, self.config.stop_grace + KILL_WAIT).await;
                    return true;
                }
                StopStep::Terminate {
                    control,
                    exited,
                    port,
                    pid,
                } => {
                    tracing::info!(resource_id = %id, port, ?pid, "stopping preview instance");
                    self.terminate_and_reap(control, exited).await;
                    return true;
                }
            }
        }
    }

    /// Idempotent teardown. Returns `false` when no instance existed.
    pub async fn stop(&self, id: &ResourceId) -> bool {
        self.stop_matching(id, |_| true).await
    }

    /// Stops `id` only if it is ready and has not been accessed for longer
    /// than `ttl`.
    pub async fn stop_if_idle(&self, id: &ResourceId, ttl: Duration) -> bool {
        self.stop_matching(id, |e| {
            e.state == PreviewState::Ready && e.last_accessed_at.elapsed() > ttl
        })
        .await
    }

    /// Tears down `id` after a proxied connection to `port` was refused.
    /// A newer instance on a different port is left alone.
    pub async fn mark_unreachable(&self, id: &ResourceId, port: u16) -> bool {
        self.stop_matching(id, |e| e.port == port && e.state == PreviewState::Ready)
            .await
    }

    /// Refreshes the last access time of a ready instance.
    pub async fn touch(&self, id: &ResourceId) -> bool {
        let mut reg = self.inner.lock().await;
        match reg.entries.get_mut(id) {
            Some(e) if e.state == PreviewState::Ready => {
                e.last_accessed_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub async fn idle_candidates(&self, ttl: Duration) -> Vec<ResourceId> {
        let reg = self.inner.lock().await;
        reg.entries
            .iter()
            .filter(|(_, e)| {
                e.state == PreviewState::Ready
                    && !e.stopping
                    && e.last_accessed_at.elapsed() > ttl
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn status(&self, id: &ResourceId) -> Option<PreviewStatus> {
        let reg = self.inner.lock().await;
        reg.entries.get(id).map(|e| e.snapshot(id))
    }

    pub async fn list(&self) -> Vec<PreviewStatus> {
        let reg = self.inner.lock().await;
        let mut out: Vec<_> = reg.entries.iter().map(|(id, e)| e.snapshot(id)).collect();
        out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        out
    }

    pub async fn instance_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Stops every instance concurrently; used on gateway shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<ResourceId> = {
            let reg = self.inner.lock().await;
            reg.entries.keys().cloned().collect()
        };
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all preview instances");
        join_all(ids.iter().map(|id| self.stop(id))).await;
    }
}
