use async_trait::async_trait;

use crate::error::{FetchError, ListError, ResourceError};
use crate::models::{LiveMatch, Snapshot};

/// Enumerates the matches that are currently live.
///
/// Must be safe to call repeatedly; the discovery loop retries on failure.
#[async_trait]
pub trait MatchLister: Send + Sync {
    async fn list_live_matches(&self) -> Result<Vec<LiveMatch>, ListError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Produces one stateful [`Fetcher`] per worker.
#[async_trait]
pub trait FetcherFactory: Send + Sync {
    async fn acquire(&self, live: &LiveMatch) -> Result<Box<dyn Fetcher>, ResourceError>;
}

/// A long-lived, resource-bearing session bound to one match.
///
/// Owned exclusively by one worker and released explicitly when the worker
/// discards or stops.
#[async_trait]
pub trait Fetcher: Send {
    /// Produce a fresh snapshot candidate.
    async fn fetch(&mut self, live: &LiveMatch) -> Result<Snapshot, FetchError>;

    /// Lightweight recovery after a transient error (a page reload).
    async fn refresh(&mut self) -> Result<(), FetchError>;

    /// Release the underlying resource.
    async fn release(self: Box<Self>);

    /// A partial source only owns some sections, so its output is merged
    /// into the cached snapshot instead of replacing it.
    fn is_partial(&self) -> bool {
        false
    }
}
