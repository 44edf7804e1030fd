use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::live::http::normalize_base_url;
use crate::manager::{ManagerSettings, WorkerSettings};
use crate::persist::EmptyPolicy;

/// Live match odds collector
#[derive(Parser, Debug, Clone)]
#[command(name = "livefetch", version, about)]
pub struct Config {
    /// Base URL of the match feed (lists live matches and serves match events)
    #[arg(long, env = "TARGET_URL", default_value = "http://localhost:8000")]
    pub target_url: String,

    /// Path of the persisted JSON snapshot file
    #[arg(long, env = "DATA_FILE", default_value = "data/live_data.json")]
    pub data_file: String,

    /// Seconds between fetches within one worker
    #[arg(long, env = "SCRAPE_INTERVAL_SECS", default_value = "1")]
    pub scrape_interval_secs: u64,

    /// Seconds between writes of the snapshot file
    #[arg(long, env = "PERSIST_INTERVAL_SECS", default_value = "1")]
    pub persist_interval_secs: u64,

    /// Seconds between discovery cycles
    #[arg(long, env = "LIST_REFRESH_INTERVAL_SECS", default_value = "60")]
    pub list_refresh_interval_secs: u64,

    /// Seconds to wait after a failed listing before retrying
    #[arg(long, env = "LIST_RETRY_DELAY_SECS", default_value = "60")]
    pub list_retry_delay_secs: u64,

    /// Milliseconds between consecutive worker starts
    #[arg(long, env = "SPAWN_STAGGER_MS", default_value = "1000")]
    pub spawn_stagger_ms: u64,

    /// Timeout for every external call (list, acquire, fetch, refresh)
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "10")]
    pub request_timeout_secs: u64,

    /// Consecutive transient fetch errors tolerated before a rebuild
    #[arg(long, env = "MAX_FETCH_ERRORS", default_value = "5")]
    pub max_fetch_errors: u32,

    /// Resource failures (failed acquisitions + rebuilds) before a worker gives up
    #[arg(long, env = "MAX_RESOURCE_ERRORS", default_value = "5")]
    pub max_resource_errors: u32,

    /// Seconds to wait after a failed fetcher acquisition
    #[arg(long, env = "RESOURCE_BACKOFF_SECS", default_value = "10")]
    pub resource_backoff_secs: u64,

    /// Seconds to wait after tearing down a fetcher before rebuilding it
    #[arg(long, env = "REBUILD_BACKOFF_SECS", default_value = "5")]
    pub rebuild_backoff_secs: u64,

    /// Seconds to wait for each worker to exit during shutdown
    #[arg(long, env = "WORKER_JOIN_TIMEOUT_SECS", default_value = "5")]
    pub worker_join_timeout_secs: u64,

    /// What to write when no match is live
    #[arg(long, env = "EMPTY_POLICY", value_enum, default_value = "skip")]
    pub empty_policy: EmptyPolicy,

    /// Read API listen address (disabled when unset)
    #[arg(long, env = "API_ADDR")]
    pub api_addr: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("scrape_interval_secs", self.scrape_interval_secs),
            ("persist_interval_secs", self.persist_interval_secs),
            ("list_refresh_interval_secs", self.list_refresh_interval_secs),
            ("list_retry_delay_secs", self.list_retry_delay_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("resource_backoff_secs", self.resource_backoff_secs),
            ("rebuild_backoff_secs", self.rebuild_backoff_secs),
            ("worker_join_timeout_secs", self.worker_join_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.max_fetch_errors == 0 {
            anyhow::bail!("max_fetch_errors must be at least 1");
        }
        if self.max_resource_errors == 0 {
            anyhow::bail!("max_resource_errors must be at least 1");
        }
        if self.data_file.trim().is_empty() {
            anyhow::bail!("data_file must not be empty");
        }
        normalize_base_url(&self.target_url)?;
        self.api_socket_addr()?;
        Ok(())
    }

    pub fn api_socket_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        match &self.api_addr {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid api_addr {:?}: {}", raw, e)),
            None => Ok(None),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_join_timeout_secs)
    }

    /// Bound on waiting for the persister: one and a half intervals, at least 1s.
    pub fn persister_join_timeout(&self) -> Duration {
        self.persist_interval()
            .mul_f64(1.5)
            .max(Duration::from_secs(1))
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_secs(self.scrape_interval_secs),
            fetch_timeout: self.request_timeout(),
            acquire_timeout: self.request_timeout(),
            max_fetch_errors: self.max_fetch_errors,
            max_resource_errors: self.max_resource_errors,
            resource_backoff: Duration::from_secs(self.resource_backoff_secs),
            rebuild_backoff: Duration::from_secs(self.rebuild_backoff_secs),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            discovery_interval: Duration::from_secs(self.list_refresh_interval_secs),
            list_retry_delay: Duration::from_secs(self.list_retry_delay_secs),
            spawn_stagger: Duration::from_millis(self.spawn_stagger_ms),
            list_timeout: self.request_timeout(),
            worker: self.worker_settings(),
        }
    }
}
