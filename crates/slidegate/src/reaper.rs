use std::time::Duration;

use slidegate_process::ResourceId;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::Instrument;

use crate::supervisor::ProcessSupervisor;

/// Periodically stops ready instances that nobody has touched for `ttl`.
#[derive(Clone)]
pub struct IdleReaper {
    supervisor: ProcessSupervisor,
    ttl: Duration,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(supervisor: ProcessSupervisor, ttl: Duration, interval: Duration) -> Self {
        Self {
            supervisor,
            ttl,
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = tracing::info_span!(
            "idle_reaper",
            ttl_sec = self.ttl.as_secs(),
            interval_sec = self.interval.as_secs()
        );
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick fires immediately; nothing can be idle yet.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stops = self.sweep().await;
                    if !stops.is_empty() {
                        tracing::debug!(count = stops.len(), "idle sweep dispatched");
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Starts one independent stop per idle candidate and returns without
    /// waiting for them, so a slow teardown never delays the next tick. The
    /// idle check is repeated under the registry lock at stop time; an
    /// instance touched after it was listed survives.
    pub async fn sweep(&self) -> Vec<(ResourceId, JoinHandle<bool>)> {
        let candidates = self.supervisor.idle_candidates(self.ttl).await;
        candidates
            .into_iter()
            .map(|id| {
                let supervisor = self.supervisor.clone();
                let ttl = self.ttl;
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    let stopped = supervisor.stop_if_idle(&task_id, ttl).await;
                    if stopped {
                        tracing::info!(resource_id = %task_id, "stopped idle preview instance");
                    }
                    stopped
                });
                (id, handle)
            })
            .collect()
    }
}
