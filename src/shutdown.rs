//! Process-wide shutdown coordination.
//!
//! A root [`CancellationToken`] stops the discovery loop, the persister and
//! the read API. Workers hang off a second token that is cancelled only after
//! the persister has made its final write, so that write sees every match that
//! was live at shutdown. Triggering is idempotent; a second OS signal during
//! shutdown is logged and otherwise ignored.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::manager::{join_workers, WorkerTable};
use crate::models::MatchId;

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    workers: CancellationToken,
    triggered: Arc<AtomicBool>,
}

/// Join bounds for each stage of [`ShutdownCoordinator::drain`].
#[derive(Debug, Clone)]
pub struct JoinBounds {
    pub discovery: Duration,
    pub persister: Duration,
    pub worker: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator::default()
    }

    /// The root token. Cancelled exactly once, by [`trigger`](Self::trigger).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown. Returns `false` if it was already in progress.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress ({}). Please be patient.", reason);
            return false;
        }
        info!("Shutdown triggered: {}. Telling all tasks to stop...", reason);
        self.token.cancel();
        true
    }

    /// Parent of every worker's stop token. Not a child of [`token`](Self::token).
    pub fn worker_token(&self) -> CancellationToken {
        self.workers.clone()
    }

    /// Ordered join phase, run after [`trigger`](Self::trigger).
    ///
    /// Discovery loop first, so no worker starts behind our back. Then the
    /// persister, whose final write runs while every worker is still alive.
    /// Only then are the workers stopped and joined, each within its own
    /// bound. Returns the workers that missed it.
    pub async fn drain(
        &self,
        discovery: Option<JoinHandle<()>>,
        persister: JoinHandle<()>,
        workers: &WorkerTable,
        bounds: &JoinBounds,
    ) -> Vec<MatchId> {
        if let Some(task) = discovery {
            join_with_timeout("discovery loop", task, bounds.discovery).await;
        }

        info!("Waiting for persister to finish...");
        join_with_timeout("persister", persister, bounds.persister).await;

        self.workers.cancel();
        let signalled = workers.cancel_all();
        info!("Signalled {} worker(s) to stop.", signalled);
        if workers.is_empty() {
            return Vec::new();
        }

        let stragglers = join_workers(workers, bounds.worker).await;
        if !stragglers.is_empty() {
            warn!(
                "{} worker(s) did not exit in time and were abandoned: {:?}",
                stragglers.len(),
                stragglers
            );
        }
        stragglers
    }

    /// Listen for SIGINT / SIGTERM for the lifetime of the process.
    ///
    /// Every signal calls [`trigger`](Self::trigger); only the first one has
    /// any effect.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        None
                    }
                };

            loop {
                #[cfg(unix)]
                let sigterm = async {
                    match terminate.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                #[cfg(not(unix))]
                let sigterm = std::future::pending::<()>();

                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            error!("Failed to listen for Ctrl+C: {}", e);
                            return;
                        }
                        coordinator.trigger("received SIGINT");
                    }
                    () = sigterm => {
                        coordinator.trigger("received SIGTERM");
                    }
                }
            }
        })
    }
}

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `true` if the wait was cut short by cancellation.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Await a task for at most `bound`. Logs and returns `false` on a straggler.
pub async fn join_with_timeout<T, F>(name: &str, task: F, bound: Duration) -> bool
where
    F: Future<Output = Result<T, tokio::task::JoinError>>,
{
    match tokio::time::timeout(bound, task).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            error!("Task {} ended abnormally: {}", name, e);
            true
        }
        Err(_) => {
            warn!("Task {} did not exit within {:?}.", name, bound);
            false
        }
    }
}
