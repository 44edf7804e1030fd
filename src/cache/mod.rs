//! In-memory snapshot cache shared by all workers and the persister.
//!
//! Each worker is the single writer of its own match's entry: it publishes
//! on every successful fetch and deletes the entry when it stops. The
//! persister takes point-in-time copies and serializes them without holding
//! the lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{MatchId, Snapshot};

/// Thread-safe map of match ID → latest snapshot.
#[derive(Clone, Default)]
pub struct SnapshotCache {
    inner: Arc<RwLock<HashMap<MatchId, Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        SnapshotCache::default()
    }

    /// Replace the snapshot for its match.
    pub async fn put(&self, snapshot: Snapshot) {
        let mut inner = self.inner.write().await;
        inner.insert(snapshot.match_id.clone(), snapshot);
    }

    /// Merge a partial snapshot into the cached one, or insert it if absent.
    pub async fn merge(&self, partial: Snapshot) {
        let mut inner = self.inner.write().await;
        match inner.get_mut(&partial.match_id) {
            Some(existing) => existing.merge_from(partial),
            None => {
                inner.insert(partial.match_id.clone(), partial);
            }
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Snapshot> {
        let removed = self.inner.write().await.remove(id);
        if removed.is_some() {
            debug!("SnapshotCache: removed {}", id);
        }
        removed
    }

    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<Snapshot> {
        self.inner.read().await.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    /// Owned copy of every snapshot, ordered by match ID.
    pub async fn snapshot_all(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        all
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
