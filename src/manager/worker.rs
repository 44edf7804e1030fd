//! Per-match fetch worker.
//!
//! ```text
//!  Acquiring ──ok──▶ Fetching ──ok──▶ Publishing ──wait──▶ Fetching
//!     ▲  │              │                  │
//!     │  └─ceiling─┐    ├─transient─▶ Recovering ──refresh──▶ Fetching
//!     │            │    │                  │
//!     └──rebuild───┼────┴─fatal / too many transient
//!                  ▼
//!               Stopped  (release fetcher, drop cache entry, drop own handle)
//! ```
//!
//! Two independent bounded counters drive recovery: consecutive transient
//! fetch errors, and resource failures (failed acquisitions plus forced
//! rebuilds). Stopped cleanup always runs, including after a panic.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::WorkerTable;
use crate::cache::SnapshotCache;
use crate::error::FetchError;
use crate::live::{Fetcher, FetcherFactory};
use crate::models::{LiveMatch, Snapshot};
use crate::shutdown::sleep_or_cancel;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Wait between successful fetches.
    pub poll_interval: Duration,
    /// Bound on a single fetch or refresh call.
    pub fetch_timeout: Duration,
    /// Bound on a single fetcher acquisition.
    pub acquire_timeout: Duration,
    /// Consecutive transient errors tolerated before a rebuild.
    pub max_fetch_errors: u32,
    /// Resource failures after which the worker gives up.
    pub max_resource_errors: u32,
    /// Wait after a failed acquisition.
    pub resource_backoff: Duration,
    /// Wait after discarding a fetcher, before acquiring a new one.
    pub rebuild_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The match reached a terminal status.
    Finished(String),
    /// The stop signal was received.
    Cancelled,
    /// Too many resource failures.
    ResourceExhausted,
    /// The loop panicked; cleanup still ran.
    Panicked,
}

enum State {
    Acquiring,
    Fetching,
    Publishing(Snapshot),
    Recovering(FetchError),
    Rebuilding(String),
    Stopped(WorkerExit),
}

/// Consecutive-failure counter with a fixed ceiling.
#[derive(Debug)]
struct RetryCounter {
    count: u32,
    ceiling: u32,
}

impl RetryCounter {
    fn new(ceiling: u32) -> Self {
        RetryCounter { count: 0, ceiling }
    }

    fn increment(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    fn reached(&self) -> bool {
        self.count >= self.ceiling
    }

    fn exceeded(&self) -> bool {
        self.count > self.ceiling
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

pub struct Worker {
    live: LiveMatch,
    generation: u64,
    factory: Arc<dyn FetcherFactory>,
    cache: SnapshotCache,
    table: WorkerTable,
    cancel: CancellationToken,
    settings: WorkerSettings,
    fetcher: Option<Box<dyn Fetcher>>,
    fetch_errors: RetryCounter,
    resource_errors: RetryCounter,
}

impl Worker {
    pub fn new(
        live: LiveMatch,
        generation: u64,
        factory: Arc<dyn FetcherFactory>,
        cache: SnapshotCache,
        table: WorkerTable,
        cancel: CancellationToken,
        settings: WorkerSettings,
    ) -> Self {
        let fetch_errors = RetryCounter::new(settings.max_fetch_errors);
        let resource_errors = RetryCounter::new(settings.max_resource_errors);
        Worker {
            live,
            generation,
            factory,
            cache,
            table,
            cancel,
            settings,
            fetcher: None,
            fetch_errors,
            resource_errors,
        }
    }

    /// Drive the state machine to completion, then clean up unconditionally.
    pub async fn run(mut self) -> WorkerExit {
        info!("Starting for: {}", self.live.teams);

        let exit = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(exit) => exit,
            Err(_) => {
                error!("Worker loop panicked; cleaning up");
                WorkerExit::Panicked
            }
        };

        self.cleanup().await;
        info!("Cleaned up and stopped ({:?}).", exit);
        exit
    }

    async fn drive(&mut self) -> WorkerExit {
        let mut state = State::Acquiring;
        loop {
            state = match state {
                State::Acquiring => self.acquire().await,
                State::Fetching => self.fetch().await,
                State::Publishing(snapshot) => self.publish(snapshot).await,
                State::Recovering(err) => self.recover(err).await,
                State::Rebuilding(reason) => self.rebuild(&reason).await,
                State::Stopped(exit) => return exit,
            };
        }
    }

    async fn acquire(&mut self) -> State {
        if self.cancel.is_cancelled() {
            return State::Stopped(WorkerExit::Cancelled);
        }

        debug!("Setting up new fetcher...");
        let attempt = tokio::time::timeout(self.settings.acquire_timeout, self.factory.acquire(&self.live)).await;
        let err = match attempt {
            Ok(Ok(fetcher)) => {
                self.fetcher = Some(fetcher);
                info!("Fetcher setup successful.");
                return State::Fetching;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("acquire timed out after {:?}", self.settings.acquire_timeout),
        };

        let n = self.resource_errors.increment();
        error!(
            "Failed to set up fetcher: {}. Attempt {}/{}.",
            err, n, self.settings.max_resource_errors
        );
        if self.resource_errors.reached() {
            error!("Failed to set up fetcher {} times. Giving up.", n);
            return State::Stopped(WorkerExit::ResourceExhausted);
        }

        if sleep_or_cancel(&self.cancel, self.settings.resource_backoff).await {
            return State::Stopped(WorkerExit::Cancelled);
        }
        State::Acquiring
    }

    async fn fetch(&mut self) -> State {
        if self.cancel.is_cancelled() {
            return State::Stopped(WorkerExit::Cancelled);
        }
        let Some(fetcher) = self.fetcher.as_mut() else {
            return State::Acquiring;
        };

        // Not raced against the stop signal: an in-flight fetch completes.
        let result = match tokio::time::timeout(self.settings.fetch_timeout, fetcher.fetch(&self.live)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Transient(format!(
                "fetch timed out after {:?}",
                self.settings.fetch_timeout
            ))),
        };

        if self.cancel.is_cancelled() {
            return State::Stopped(WorkerExit::Cancelled);
        }

        match result {
            Ok(snapshot) => {
                self.fetch_errors.reset();
                self.resource_errors.reset();
                State::Publishing(snapshot)
            }
            Err(e) if e.is_transient() => State::Recovering(e),
            Err(e) => {
                error!("Fetcher exception: {}. Rebuilding fetcher.", e);
                State::Rebuilding(e.to_string())
            }
        }
    }

    async fn publish(&mut self, snapshot: Snapshot) -> State {
        if snapshot.status.is_terminal() {
            let result = snapshot.status.result().unwrap_or_default().to_string();
            info!("Match result found ('{}'). Stopping.", result);
            return State::Stopped(WorkerExit::Finished(result));
        }

        let partial = self.fetcher.as_ref().map_or(false, |f| f.is_partial());
        if partial {
            self.cache.merge(snapshot).await;
        } else {
            self.cache.put(snapshot).await;
        }

        if sleep_or_cancel(&self.cancel, self.settings.poll_interval).await {
            return State::Stopped(WorkerExit::Cancelled);
        }
        State::Fetching
    }

    async fn recover(&mut self, err: FetchError) -> State {
        let n = self.fetch_errors.increment();
        warn!("Error fetching details: {}. Retrying ({}/{})...", err, n, self.settings.max_fetch_errors);

        if self.fetch_errors.exceeded() {
            self.fetch_errors.reset();
            error!("Too many consecutive fetch errors. Rebuilding fetcher.");
            return State::Rebuilding("too many consecutive fetch errors".to_string());
        }

        if let Some(fetcher) = self.fetcher.as_mut() {
            let refreshed = tokio::time::timeout(self.settings.fetch_timeout, fetcher.refresh()).await;
            match refreshed {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_transient() => {
                    error!("Fetcher exception on refresh: {}. Rebuilding fetcher.", e);
                    return State::Rebuilding(e.to_string());
                }
                Ok(Err(e)) => debug!("Refresh failed: {}", e),
                Err(_) => debug!("Refresh timed out"),
            }
        }

        if sleep_or_cancel(&self.cancel, self.settings.poll_interval).await {
            return State::Stopped(WorkerExit::Cancelled);
        }
        State::Fetching
    }

    async fn rebuild(&mut self, reason: &str) -> State {
        self.release_fetcher().await;

        let n = self.resource_errors.increment();
        if self.resource_errors.reached() {
            error!(
                "Fetcher rebuilt {} times without a successful fetch ({}). Giving up.",
                n, reason
            );
            return State::Stopped(WorkerExit::ResourceExhausted);
        }

        info!("Waiting {:?} before creating new fetcher...", self.settings.rebuild_backoff);
        if sleep_or_cancel(&self.cancel, self.settings.rebuild_backoff).await {
            return State::Stopped(WorkerExit::Cancelled);
        }
        State::Acquiring
    }

    async fn release_fetcher(&mut self) {
        if let Some(fetcher) = self.fetcher.take() {
            debug!("Quitting current fetcher instance.");
            fetcher.release().await;
        }
    }

    /// Release the fetcher, then drop the cache entry, then the table entry.
    /// In that order, the cache never holds an entry without a registered worker.
    async fn cleanup(&mut self) {
        self.release_fetcher().await;
        self.cache.remove(&self.live.id).await;
        self.table.remove_if(&self.live.id, self.generation);
    }
}
