//! Scripted fakes for the lister and fetcher traits.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FetchError, ListError, ResourceError};
use crate::live::{Fetcher, FetcherFactory, MatchLister};
use crate::models::{LiveMatch, MatchId, MatchStatus, Snapshot};

pub fn in_progress() -> MatchStatus {
    MatchStatus::InProgress
}

pub fn live_set(ids: &[&str]) -> Vec<LiveMatch> {
    ids.iter()
        .map(|id| LiveMatch::new(*id, format!("{} home v {} away", id, id)))
        .collect()
}

/// Lister returning whatever live set it was last given.
pub struct ScriptedLister {
    current: Mutex<Result<Vec<LiveMatch>, String>>,
    calls: AtomicU32,
}

impl ScriptedLister {
    pub fn new(ids: &[&str]) -> Self {
        ScriptedLister {
            current: Mutex::new(Ok(live_set(ids))),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_live(&self, ids: &[&str]) {
        *self.current.lock().unwrap() = Ok(live_set(ids));
    }

    pub fn set_raw(&self, matches: Vec<LiveMatch>) {
        *self.current.lock().unwrap() = Ok(matches);
    }

    pub fn set_failing(&self, reason: &str) {
        *self.current.lock().unwrap() = Err(reason.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchLister for ScriptedLister {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_live_matches(&self) -> Result<Vec<LiveMatch>, ListError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.current
            .lock()
            .unwrap()
            .clone()
            .map_err(ListError::Request)
    }
}

#[derive(Debug, Clone)]
pub enum FetchStep {
    Ok(MatchStatus),
    Transient,
    Fatal,
    Panic,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    acquire_attempts: u32,
    acquired: u32,
    released: u32,
    refreshed: u32,
    fetch_started: u32,
    fetch_completed: u32,
    active: u32,
    max_active: u32,
}

#[derive(Default)]
struct FactoryState {
    /// Shared by every fetcher for a match, so a rebuild resumes the script.
    scripts: HashMap<MatchId, VecDeque<FetchStep>>,
    acquire_failures: HashMap<MatchId, u32>,
    counters: HashMap<MatchId, Counters>,
    fetch_delay: Duration,
    partial: bool,
}

/// Factory whose fetchers replay a per-match script of outcomes. Once a
/// script runs out every fetch returns an in-progress snapshot.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        ScriptedFactory::default()
    }

    pub fn script(&self, id: &str, steps: Vec<FetchStep>) {
        self.state.lock().unwrap().scripts.insert(id.to_string(), steps.into());
    }

    /// Fail the next `times` acquisitions for `id`.
    pub fn fail_acquire(&self, id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .acquire_failures
            .insert(id.to_string(), times);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = delay;
    }

    pub fn set_partial(&self, partial: bool) {
        self.state.lock().unwrap().partial = partial;
    }

    fn counter(&self, id: &str, read: impl Fn(&Counters) -> u32) -> u32 {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(id)
            .map(read)
            .unwrap_or(0)
    }

    pub fn acquire_attempts(&self, id: &str) -> u32 {
        self.counter(id, |c| c.acquire_attempts)
    }

    pub fn acquired(&self, id: &str) -> u32 {
        self.counter(id, |c| c.acquired)
    }

    pub fn released(&self, id: &str) -> u32 {
        self.counter(id, |c| c.released)
    }

    pub fn refreshed(&self, id: &str) -> u32 {
        self.counter(id, |c| c.refreshed)
    }

    pub fn fetch_started(&self, id: &str) -> u32 {
        self.counter(id, |c| c.fetch_started)
    }

    pub fn fetch_completed(&self, id: &str) -> u32 {
        self.counter(id, |c| c.fetch_completed)
    }

    /// Highest number of fetchers held at the same time for `id`.
    pub fn max_active(&self, id: &str) -> u32 {
        self.counter(id, |c| c.max_active)
    }
}

#[async_trait]
impl FetcherFactory for ScriptedFactory {
    async fn acquire(&self, live: &LiveMatch) -> Result<Box<dyn Fetcher>, ResourceError> {
        let mut state = self.state.lock().unwrap();
        let failures_left = state.acquire_failures.get(&live.id).copied().unwrap_or(0);
        if failures_left > 0 {
            state.acquire_failures.insert(live.id.clone(), failures_left - 1);
        }
        let counters = state.counters.entry(live.id.clone()).or_default();
        counters.acquire_attempts += 1;
        if failures_left > 0 {
            return Err(ResourceError("scripted acquire failure".into()));
        }
        counters.acquired += 1;
        counters.active += 1;
        counters.max_active = counters.max_active.max(counters.active);
        let partial = state.partial;

        Ok(Box::new(ScriptedFetcher {
            id: live.id.clone(),
            partial,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedFetcher {
    id: MatchId,
    partial: bool,
    state: Arc<Mutex<FactoryState>>,
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&mut self, live: &LiveMatch) -> Result<Snapshot, FetchError> {
        let (step, delay, n) = {
            let mut state = self.state.lock().unwrap();
            let step = state
                .scripts
                .get_mut(&self.id)
                .and_then(|s| s.pop_front())
                .unwrap_or(FetchStep::Ok(MatchStatus::InProgress));
            let delay = state.fetch_delay;
            let counters = state.counters.entry(self.id.clone()).or_default();
            counters.fetch_started += 1;
            (step, delay, counters.fetch_started)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.counters.entry(self.id.clone()).or_default().fetch_completed += 1;
        }

        match step {
            FetchStep::Ok(status) => {
                Ok(Snapshot::new(live, status).with_section("odds", json!([{ "fetch": n }])))
            }
            FetchStep::Transient => Err(FetchError::Transient("scripted timeout".into())),
            FetchStep::Fatal => Err(FetchError::Fatal("scripted session crash".into())),
            FetchStep::Panic => panic!("scripted panic in fetcher"),
        }
    }

    async fn refresh(&mut self) -> Result<(), FetchError> {
        let mut state = self.state.lock().unwrap();
        state.counters.entry(self.id.clone()).or_default().refreshed += 1;
        Ok(())
    }

    async fn release(self: Box<Self>) {
        let mut state = self.state.lock().unwrap();
        let counters = state.counters.entry(self.id.clone()).or_default();
        counters.released += 1;
        counters.active = counters.active.saturating_sub(1);
    }

    fn is_partial(&self) -> bool {
        self.partial
    }
}
