use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Externally assigned match identifier. Stable for the lifetime of a match.
pub type MatchId = String;

/// A match reported as live by the lister, with its static display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMatch {
    pub id: MatchId,
    /// Display name, e.g. "Team A v Team B"
    pub teams: String,
}

impl LiveMatch {
    pub fn new(id: impl Into<MatchId>, teams: impl Into<String>) -> Self {
        LiveMatch {
            id: id.into(),
            teams: teams.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    InProgress,
    /// Terminal: once observed the owning worker stops itself.
    Finished { result: String },
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        self.result().is_some()
    }

    /// Result text of a finished match.
    pub fn result(&self) -> Option<&str> {
        match self {
            MatchStatus::Finished { result } => Some(result),
            _ => None,
        }
    }

    /// Interpret the result banner shown on a match page.
    ///
    /// No banner (or "In Progress") means the match is still running; an
    /// empty banner means the page flagged the match as over without text.
    pub fn from_result_text(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            None => MatchStatus::InProgress,
            Some(t) if t.eq_ignore_ascii_case("in progress") => MatchStatus::InProgress,
            Some("") => MatchStatus::Finished {
                result: "Finished".to_string(),
            },
            Some(t) => MatchStatus::Finished {
                result: t.to_string(),
            },
        }
    }
}

/// Latest known data for one match.
///
/// Sections (odds, bookmaker, fancy, sessions, ...) are kept as opaque JSON
/// and flattened into the top-level object when serialized, so the persisted
/// file reads `{"match_id": .., "teams": .., "status": .., "odds": [..], ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub match_id: MatchId,
    pub teams: String,
    pub status: MatchStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub sections: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    pub fn new(live: &LiveMatch, status: MatchStatus) -> Self {
        Snapshot {
            match_id: live.id.clone(),
            teams: live.teams.clone(),
            status,
            last_updated: Utc::now(),
            sections: BTreeMap::new(),
        }
    }

    pub fn with_section(mut self, name: &str, value: serde_json::Value) -> Self {
        self.sections.insert(name.to_string(), value);
        self
    }

    /// Field-level merge for partial sources: status and timestamp come from
    /// `newer`, sections are overlaid key by key and never deleted.
    pub fn merge_from(&mut self, newer: Snapshot) {
        self.teams = newer.teams;
        self.status = newer.status;
        self.last_updated = newer.last_updated;
        self.sections.extend(newer.sections);
    }
}
