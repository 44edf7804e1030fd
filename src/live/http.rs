//! JSON feed adapters for the lister and per-match fetchers.
//!
//! Layout of the upstream feed:
//! ```text
//!  GET {base}/api/matches/live?page=N  → [ {id, teams}, .. ]
//!                                        or {"matches": [..], "next_page": N}
//!  GET {base}/api/event/{id}           → {"result": .., "odds": [..], ..}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::provider::{Fetcher, FetcherFactory, MatchLister};
use crate::error::{FetchError, ListError, ResourceError};
use crate::models::{LiveMatch, MatchStatus, Snapshot};

/// Upper bound on pages walked per listing, in case the feed loops.
const MAX_PAGES: u64 = 50;

/// Top-level keys of an event payload that are not odds sections.
const RESERVED_KEYS: &[&str] = &["match_id", "teams", "last_updated", "status", "result"];

/// Parse a base URL and make sure relative joins append to its path.
pub fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid base URL '{}'", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("base URL '{}' must use http or https", raw);
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

/// Lister backed by the paginated live-matches endpoint.
pub struct HttpLister {
    http: Client,
    base_url: Url,
}

impl HttpLister {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = build_client(timeout).context("Failed to build HTTP client")?;
        Ok(HttpLister {
            http,
            base_url: normalize_base_url(base_url)?,
        })
    }

    async fn fetch_page(&self, page: u64) -> Result<Value, ListError> {
        let mut url = self
            .base_url
            .join("api/matches/live")
            .map_err(|e| ListError::Request(e.to_string()))?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        debug!("Fetching live match list page {} from {}", page, url);

        let resp = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ListError::Request(format!("timed out: {}", e))
            } else {
                ListError::Request(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(ListError::Request(format!("HTTP {}", resp.status())));
        }

        resp.json()
            .await
            .map_err(|e| ListError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MatchLister for HttpLister {
    fn name(&self) -> &str {
        "http-feed"
    }

    async fn list_live_matches(&self) -> Result<Vec<LiveMatch>, ListError> {
        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        let mut page = 1u64;

        loop {
            // Later pages may vanish while we walk them; keep what we saw.
            let parsed = match self.fetch_page(page).await.and_then(|raw| parse_match_page(&raw)) {
                Ok(p) => p,
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    warn!("Match list changed mid-iteration at page {}: {}. Stopping.", page, e);
                    break;
                }
            };

            if parsed.matches.is_empty() {
                break;
            }
            for m in parsed.matches {
                if seen.insert(m.id.clone()) {
                    matches.push(m);
                }
            }

            match parsed.next_page {
                Some(next) if next > page && next <= MAX_PAGES => page = next,
                Some(next) if next > MAX_PAGES => {
                    warn!(
                        "Match list points past page {} (next_page={}). Stopping with {} match(es).",
                        MAX_PAGES,
                        next,
                        matches.len()
                    );
                    break;
                }
                _ => break,
            }
        }

        Ok(matches)
    }
}

#[derive(Debug, Default)]
struct MatchPage {
    matches: Vec<LiveMatch>,
    next_page: Option<u64>,
}

fn parse_match_page(raw: &Value) -> Result<MatchPage, ListError> {
    if let Some(items) = raw.as_array() {
        return Ok(MatchPage {
            matches: items.iter().filter_map(parse_match_entry).collect(),
            next_page: None,
        });
    }

    let items = raw
        .get("matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ListError::Malformed("expected an array or a 'matches' field".into()))?;

    Ok(MatchPage {
        matches: items.iter().filter_map(parse_match_entry).collect(),
        next_page: raw.get("next_page").and_then(|n| n.as_u64()),
    })
}

fn parse_match_entry(entry: &Value) -> Option<LiveMatch> {
    let id = match entry.get("id")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let teams = entry
        .get("teams")
        .or_else(|| entry.get("name"))
        .and_then(|t| t.as_str())
        .map(clean_title)
        .unwrap_or_else(|| "Unknown".to_string());

    Some(LiveMatch::new(id, teams))
}

/// "Cricket | Team A v Team B" → "Team A v Team B"
fn clean_title(raw: &str) -> String {
    match raw.split_once('|') {
        Some((_, rest)) => rest.trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Builds one dedicated HTTP session per worker.
pub struct HttpFetcherFactory {
    base_url: Url,
    timeout: Duration,
}

impl HttpFetcherFactory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(HttpFetcherFactory {
            base_url: normalize_base_url(base_url)?,
            timeout,
        })
    }

    fn event_url(&self, id: &str) -> Result<Url, ResourceError> {
        let mut url = self
            .base_url
            .join("api/event/")
            .map_err(|e| ResourceError(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ResourceError("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }
}

#[async_trait]
impl FetcherFactory for HttpFetcherFactory {
    async fn acquire(&self, live: &LiveMatch) -> Result<Box<dyn Fetcher>, ResourceError> {
        let http = build_client(self.timeout).map_err(|e| ResourceError(e.to_string()))?;
        let url = self.event_url(&live.id)?;

        // Load the event once so a dead upstream fails here, not on first fetch.
        http.get(url.clone())
            .send()
            .await
            .map_err(|e| ResourceError(format!("initial load of {} failed: {}", url, e)))?;

        debug!("Fetcher session ready for {}", url);
        Ok(Box::new(HttpFetcher { http, url }))
    }
}

pub struct HttpFetcher {
    http: Client,
    url: Url,
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_connect() {
        FetchError::Fatal(e.to_string())
    } else {
        FetchError::Transient(e.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&mut self, live: &LiveMatch) -> Result<Snapshot, FetchError> {
        let resp = self.http.get(self.url.clone()).send().await.map_err(classify)?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                return Err(FetchError::Transient("event page not found".into()));
            }
            s if !s.is_success() => {
                return Err(FetchError::Transient(format!("HTTP {}", s)));
            }
            _ => {}
        }

        let raw: Value = resp.json().await.map_err(classify)?;
        parse_snapshot(live, &raw)
    }

    async fn refresh(&mut self) -> Result<(), FetchError> {
        self.http
            .get(self.url.clone())
            .send()
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn release(self: Box<Self>) {
        debug!("Releasing fetcher session for {}", self.url);
    }
}

/// Turn an event payload into a snapshot for `live`.
fn parse_snapshot(live: &LiveMatch, raw: &Value) -> Result<Snapshot, FetchError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| FetchError::Transient("event payload is not a JSON object".into()))?;

    let result_text = obj.get("result").and_then(|r| r.as_str());
    let status = match obj.get("status").and_then(|s| s.as_str()) {
        Some(s) => parse_status_field(s, result_text),
        None => MatchStatus::from_result_text(result_text),
    };

    let snapshot = obj
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .fold(Snapshot::new(live, status), |snap, (key, value)| {
            snap.with_section(key, value.clone())
        });
    Ok(snapshot)
}

fn parse_status_field(status: &str, result_text: Option<&str>) -> MatchStatus {
    match status.trim().to_lowercase().as_str() {
        "scheduled" | "not_started" | "ns" => MatchStatus::Scheduled,
        "finished" | "ft" | "ended" | "completed" => MatchStatus::Finished {
            result: result_text
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("Finished")
                .to_string(),
        },
        _ => MatchStatus::InProgress,
    }
}
