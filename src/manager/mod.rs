//! Discovery loop: keeps the set of running workers equal to the set of live
//! matches reported by the lister.
//!
//! Each cycle lists live matches, starts a worker for every new one (one at a
//! time, staggered), signals workers whose match disappeared, and reaps table
//! entries left behind by tasks that died without cleaning up. Stopping is
//! cooperative: the loop never removes a running worker's entry itself.

pub mod registry;
pub mod worker;

pub use registry::WorkerTable;
pub use worker::{Worker, WorkerSettings};

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::cache::SnapshotCache;
use crate::error::ListError;
use crate::live::{FetcherFactory, MatchLister};
use crate::models::MatchId;
use crate::shutdown::{join_with_timeout, sleep_or_cancel};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Wait between discovery cycles.
    pub discovery_interval: Duration,
    /// Wait before retrying after a failed listing.
    pub list_retry_delay: Duration,
    /// Delay between consecutive worker starts.
    pub spawn_stagger: Duration,
    /// Bound on a single listing call.
    pub list_timeout: Duration,
    pub worker: WorkerSettings,
}

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub found: usize,
    pub started: Vec<MatchId>,
    pub signalled: Vec<MatchId>,
    pub reaped: Vec<MatchId>,
    pub active: usize,
}

pub struct MatchManager {
    lister: Arc<dyn MatchLister>,
    factory: Arc<dyn FetcherFactory>,
    cache: SnapshotCache,
    workers: WorkerTable,
    settings: ManagerSettings,
    shutdown: CancellationToken,
    /// Parent of every worker's stop token. Kept apart from `shutdown` so
    /// workers outlive the persister's final write.
    worker_stop: CancellationToken,
}

impl MatchManager {
    pub fn new(
        lister: Arc<dyn MatchLister>,
        factory: Arc<dyn FetcherFactory>,
        cache: SnapshotCache,
        workers: WorkerTable,
        settings: ManagerSettings,
        shutdown: CancellationToken,
        worker_stop: CancellationToken,
    ) -> Self {
        MatchManager {
            lister,
            factory,
            cache,
            workers,
            settings,
            shutdown,
            worker_stop,
        }
    }

    /// Run discovery cycles until shutdown.
    pub async fn run(self) {
        info!(
            "Match manager started (lister={}, interval={:?})",
            self.lister.name(),
            self.settings.discovery_interval
        );

        while !self.shutdown.is_cancelled() {
            info!("Starting new manager cycle");

            let wait = match self.run_cycle().await {
                Ok(report) => {
                    info!(
                        "Manager cycle complete. Found: {}, started: {}, signalled: {}, active: {}. Waiting {:?}...",
                        report.found,
                        report.started.len(),
                        report.signalled.len(),
                        report.active,
                        self.settings.discovery_interval
                    );
                    self.settings.discovery_interval
                }
                Err(e) => {
                    error!(
                        "Could not list live matches: {}. Retrying in {:?}.",
                        e, self.settings.list_retry_delay
                    );
                    self.settings.list_retry_delay
                }
            };

            if sleep_or_cancel(&self.shutdown, wait).await {
                break;
            }
        }

        info!("Main manager loop exited.");
    }

    /// One reconciliation pass. A listing failure leaves all workers untouched.
    pub async fn run_cycle(&self) -> Result<CycleReport, ListError> {
        let listed = match tokio::time::timeout(self.settings.list_timeout, self.lister.list_live_matches()).await {
            Ok(result) => result?,
            Err(_) => return Err(ListError::Timeout(self.settings.list_timeout)),
        };

        let mut report = CycleReport::default();
        let mut found: HashSet<MatchId> = HashSet::new();
        let mut to_consider = Vec::new();
        for live in listed {
            if found.insert(live.id.clone()) {
                to_consider.push(live);
            }
        }
        report.found = found.len();
        if found.is_empty() {
            info!("No live matches found.");
        }

        for live in to_consider {
            if self.shutdown.is_cancelled() {
                break;
            }

            let cancel = self.worker_stop.child_token();
            let Some(generation) = self.workers.try_reserve(&live, cancel.clone()) else {
                continue;
            };

            info!("Found new match: {} (ID: {}). Starting worker.", live.teams, live.id);
            let id = live.id.clone();
            let worker = Worker::new(
                live,
                generation,
                Arc::clone(&self.factory),
                self.cache.clone(),
                self.workers.clone(),
                cancel,
                self.settings.worker.clone(),
            );
            let task = tokio::spawn(worker.run().instrument(info_span!("worker", match_id = %id)));
            self.workers.attach(&id, generation, task);
            report.started.push(id);

            if sleep_or_cancel(&self.shutdown, self.settings.spawn_stagger).await {
                break;
            }
        }

        report.signalled = self.workers.cancel_missing(&found);

        report.reaped = self.workers.reap_finished();
        for id in &report.reaped {
            self.cache.remove(id).await;
        }

        report.active = self.workers.len();
        Ok(report)
    }
}

/// Await every attached worker task, each for at most `bound`, concurrently.
///
/// Returns the IDs of workers that did not exit in time. Stragglers are left
/// running; the runtime drops them when the process exits.
pub async fn join_workers(workers: &WorkerTable, bound: Duration) -> Vec<MatchId> {
    let handles = workers.take_join_handles();
    if handles.is_empty() {
        return Vec::new();
    }
    info!("Waiting for {} worker(s) to exit...", handles.len());

    let joins = handles.into_iter().map(|(id, task)| async move {
        let name = format!("worker {}", id);
        if join_with_timeout(&name, task, bound).await {
            None
        } else {
            Some(id)
        }
    });
    let mut stragglers: Vec<MatchId> = join_all(joins).await.into_iter().flatten().collect();
    stragglers.sort();
    stragglers
}
