//! Periodic, atomic persistence of the snapshot cache.
//!
//! The target file is never written in place: snapshots are serialized into a
//! temporary file in the same directory, flushed to disk, then renamed over
//! the target. A reader opening the path therefore sees either the previous
//! complete array or the new one.

use clap::ValueEnum;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::SnapshotCache;
use crate::error::PersistError;
use crate::models::Snapshot;
use crate::shutdown::sleep_or_cancel;

/// What to do when the cache holds no snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmptyPolicy {
    /// Leave the existing file untouched.
    Skip,
    /// Replace the file with `[]`.
    WriteEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Written(usize),
    Skipped,
}

/// Serialize `snapshots` to `path` via temp file + rename. Blocking.
pub fn write_snapshots(path: &Path, snapshots: &[Snapshot]) -> Result<(), PersistError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let tmp = tempfile::Builder::new()
        .prefix(".livedata-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, snapshots)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

pub struct Persister {
    cache: SnapshotCache,
    path: PathBuf,
    interval: Duration,
    empty_policy: EmptyPolicy,
}

impl Persister {
    pub fn new(
        cache: SnapshotCache,
        path: impl Into<PathBuf>,
        interval: Duration,
        empty_policy: EmptyPolicy,
    ) -> Self {
        Persister {
            cache,
            path: path.into(),
            interval,
            empty_policy,
        }
    }

    /// Take a point-in-time copy of the cache and write it out.
    pub async fn persist_once(&self) -> Result<PersistOutcome, PersistError> {
        let snapshots = self.cache.snapshot_all().await;
        if snapshots.is_empty() && self.empty_policy == EmptyPolicy::Skip {
            debug!("No data in cache to save. Skipping write.");
            return Ok(PersistOutcome::Skipped);
        }

        let count = snapshots.len();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshots(&path, &snapshots)).await??;
        debug!("Saved {} match(es) to {}", count, self.path.display());
        Ok(PersistOutcome::Written(count))
    }

    /// Write every interval until `shutdown` fires, then write once more.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Persister started: {} every {:?} (empty policy: {:?})",
            self.path.display(),
            self.interval,
            self.empty_policy
        );

        loop {
            let cancelled = sleep_or_cancel(&shutdown, self.interval).await;
            if let Err(e) = self.persist_once().await {
                error!("Error saving data to {}: {}", self.path.display(), e);
            }
            if cancelled {
                break;
            }
        }

        info!("Persister exited after final write.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LiveMatch, MatchStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn snapshot(id: &str, rows: usize) -> Snapshot {
        let odds: Vec<_> = (0..rows).map(|i| json!({ "runner": i, "back": 1.5 })).collect();
        Snapshot::new(&LiveMatch::new(id, "A v B"), MatchStatus::InProgress)
            .with_section("odds", json!(odds))
    }

    fn read_back(path: &Path) -> Vec<Snapshot> {
        let text = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_single_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_data.json");
        let cache = SnapshotCache::new();
        let snap = snapshot("A", 2);
        cache.put(snap.clone()).await;

        let persister = Persister::new(cache, &path, Duration::from_secs(1), EmptyPolicy::Skip);
        assert_eq!(persister.persist_once().await.unwrap(), PersistOutcome::Written(1));
        assert_eq!(read_back(&path), vec![snap]);
    }

    #[tokio::test]
    async fn test_empty_cache_skip_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_data.json");
        let persister = Persister::new(
            SnapshotCache::new(),
            &path,
            Duration::from_secs(1),
            EmptyPolicy::Skip,
        );

        assert_eq!(persister.persist_once().await.unwrap(), PersistOutcome::Skipped);
        assert!(!path.exists());

        write_snapshots(&path, &[snapshot("old", 1)]).unwrap();
        persister.persist_once().await.unwrap();
        assert_eq!(read_back(&path).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cache_write_empty_produces_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_data.json");
        write_snapshots(&path, &[snapshot("old", 1)]).unwrap();

        let persister = Persister::new(
            SnapshotCache::new(),
            &path,
            Duration::from_secs(1),
            EmptyPolicy::WriteEmpty,
        );
        assert_eq!(persister.persist_once().await.unwrap(), PersistOutcome::Written(0));
        assert!(read_back(&path).is_empty());
    }

    #[test]
    fn test_write_creates_parent_dir_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("live_data.json");

        for n in 0..5 {
            write_snapshots(&path, &[snapshot("A", n)]).unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["live_data.json".to_string()]);
    }

    #[test]
    fn test_write_into_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = write_snapshots(&blocker.join("live_data.json"), &[]).unwrap_err();
        assert!(matches!(err, PersistError::Io(_)));
    }

    #[test]
    fn test_readers_never_see_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_data.json");
        write_snapshots(&path, &[snapshot("A", 1)]).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = path.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0u32;
                while !done.load(Ordering::SeqCst) {
                    let text = std::fs::read_to_string(&path).unwrap();
                    let parsed: Vec<Snapshot> = serde_json::from_str(&text)
                        .unwrap_or_else(|e| panic!("partial file observed: {}", e));
                    assert!(!parsed.is_empty());
                    reads += 1;
                }
                reads
            })
        };

        for i in 0..200 {
            let batch: Vec<Snapshot> = (0..(i % 7 + 1))
                .map(|j| snapshot(&format!("m{}", j), i % 50))
                .collect();
            write_snapshots(&path, &batch).unwrap();
        }
        done.store(true, Ordering::SeqCst);

        assert!(reader.join().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_run_writes_periodically_and_once_more_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_data.json");
        let cache = SnapshotCache::new();
        cache.put(snapshot("A", 1)).await;

        let token = CancellationToken::new();
        let persister = Persister::new(
            cache.clone(),
            &path,
            Duration::from_millis(10),
            EmptyPolicy::Skip,
        );
        let task = tokio::spawn(persister.run(token.clone()));

        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(read_back(&path).len(), 1);

        cache.put(snapshot("B", 1)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<String> = read_back(&path).into_iter().map(|s| s.match_id).collect();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
    }
}
