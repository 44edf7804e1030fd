//! Table of running workers, keyed by match ID.
//!
//! Ownership rules:
//! - the discovery loop creates entries (check-and-insert under one lock);
//! - a worker removes only its own entry, identified by generation;
//! - the discovery loop removes an entry only after its task has finished
//!   without cleaning up (an aborted task).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::worker::WorkerExit;
use crate::models::{LiveMatch, MatchId};

/// Bookkeeping for one running worker.
pub struct WorkerHandle {
    pub live: LiveMatch,
    pub generation: u64,
    pub cancel: CancellationToken,
    /// Attached right after spawn; `None` only for the instant in between.
    task: Option<JoinHandle<WorkerExit>>,
}

impl WorkerHandle {
    /// Alive until its task has been observed to finish.
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().map_or(true, |t| !t.is_finished())
    }
}

#[derive(Default)]
struct TableInner {
    next_generation: u64,
    workers: HashMap<MatchId, WorkerHandle>,
}

#[derive(Clone, Default)]
pub struct WorkerTable {
    inner: Arc<Mutex<TableInner>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        WorkerTable::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Worker table mutex poisoned (previous holder panicked), recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Insert a handle for `live` unless one already exists.
    ///
    /// Returns the new entry's generation, or `None` if a worker for this
    /// match is already registered.
    pub fn try_reserve(&self, live: &LiveMatch, cancel: CancellationToken) -> Option<u64> {
        let mut inner = self.lock();
        if inner.workers.contains_key(&live.id) {
            return None;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.workers.insert(
            live.id.clone(),
            WorkerHandle {
                live: live.clone(),
                generation,
                cancel,
                task: None,
            },
        );
        Some(generation)
    }

    /// Attach the spawned task to its entry. If the worker already exited and
    /// removed itself, the handle is simply dropped.
    pub fn attach(&self, id: &str, generation: u64, task: JoinHandle<WorkerExit>) {
        let mut inner = self.lock();
        if let Some(handle) = inner.workers.get_mut(id) {
            if handle.generation == generation {
                handle.task = Some(task);
            }
        }
    }

    /// Remove the entry for `id` if it still belongs to `generation`.
    pub fn remove_if(&self, id: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.workers.get(id) {
            Some(handle) if handle.generation == generation => {
                inner.workers.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Signal every worker whose match is not in `found`.
    ///
    /// Entries stay in the table; each worker removes its own on exit.
    /// Returns the IDs signalled for the first time.
    pub fn cancel_missing(&self, found: &HashSet<MatchId>) -> Vec<MatchId> {
        let inner = self.lock();
        let mut signalled = Vec::new();
        for (id, handle) in &inner.workers {
            if !found.contains(id) && !handle.cancel.is_cancelled() {
                info!("Match {} (ID: {}) no longer listed. Signalling worker to stop.", handle.live.teams, id);
                handle.cancel.cancel();
                signalled.push(id.clone());
            }
        }
        signalled.sort();
        signalled
    }

    /// Remove entries whose task finished without cleaning up after itself.
    pub fn reap_finished(&self) -> Vec<MatchId> {
        let mut inner = self.lock();
        let dead: Vec<MatchId> = inner
            .workers
            .iter()
            .filter(|(_, h)| !h.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            if let Some(handle) = inner.workers.remove(id) {
                warn!("Cleaning up dead worker entry for {} (ID: {})", handle.live.teams, id);
            }
        }
        dead
    }

    /// Cancel every registered worker. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let inner = self.lock();
        for handle in inner.workers.values() {
            handle.cancel.cancel();
        }
        inner.workers.len()
    }

    /// Take every attached join handle so the caller can await them.
    /// Entries stay registered until their workers remove them.
    pub fn take_join_handles(&self) -> Vec<(MatchId, JoinHandle<WorkerExit>)> {
        let mut inner = self.lock();
        inner
            .workers
            .iter_mut()
            .filter_map(|(id, h)| h.task.take().map(|t| (id.clone(), t)))
            .collect()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().workers.contains_key(id)
    }

    #[cfg(test)]
    pub fn is_cancelled(&self, id: &str) -> Option<bool> {
        self.lock().workers.get(id).map(|h| h.cancel.is_cancelled())
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<MatchId> {
        let mut ids: Vec<MatchId> = self.lock().workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
