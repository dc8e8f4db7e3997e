use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a match as far as notifications are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    Scheduled,
    InProgress,
    Halftime,
    FullTime,
}

impl MatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPhase::Scheduled => "scheduled",
            MatchPhase::InProgress => "in_progress",
            MatchPhase::Halftime => "halftime",
            MatchPhase::FullTime => "full_time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(MatchPhase::Scheduled),
            "in_progress" => Some(MatchPhase::InProgress),
            "halftime" => Some(MatchPhase::Halftime),
            "full_time" => Some(MatchPhase::FullTime),
            _ => None,
        }
    }
}

/// Who receives a cycle's notifications. Each audience keeps its own
/// `MatchState` per match, so both can announce the same transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Every fan with notifications enabled
    #[default]
    All,
    /// Fans following either team in the match
    Team,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Team => "team",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Audience::All),
            "team" => Some(Audience::Team),
            _ => None,
        }
    }
}

/// Last observed state of one upstream match, as persisted between polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    /// External event ID from the scoreboard provider
    pub match_id: String,
    #[serde(default)]
    pub audience: Audience,
    pub home_score: u32,
    pub away_score: u32,
    pub status: MatchPhase,
    /// Serialized snapshot (JSON array of incident keys) of the last incident list
    pub details_hash: String,
    /// Write counter for optimistic concurrency; 1 on first insert
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl MatchState {
    /// Seed a state from the first observation of a match.
    pub fn seed(snapshot: &MatchSnapshot, audience: Audience) -> Self {
        MatchState {
            match_id: snapshot.match_id.clone(),
            audience,
            home_score: snapshot.home_score,
            away_score: snapshot.away_score,
            status: snapshot.status,
            details_hash: snapshot.details_hash(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    /// The state that replaces `self` after observing `snapshot`.
    pub fn advance(&self, snapshot: &MatchSnapshot) -> Self {
        MatchState {
            match_id: self.match_id.clone(),
            audience: self.audience,
            home_score: snapshot.home_score,
            away_score: snapshot.away_score,
            status: snapshot.status,
            details_hash: snapshot.details_hash(),
            version: self.version + 1,
            updated_at: Utc::now(),
        }
    }

    /// Incident keys recorded in `details_hash`. `None` if the stored value
    /// cannot be parsed.
    pub fn incident_keys(&self) -> Option<Vec<String>> {
        if self.details_hash.is_empty() {
            return Some(Vec::new());
        }
        serde_json::from_str(&self.details_hash).ok()
    }
}

/// Where and how a fan's frame notifications are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDetails {
    pub url: String,
    pub token: String,
}

/// A fan with notification details, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Farcaster user ID
    pub fid: u64,
    pub details: NotificationDetails,
}

/// Everything stored for one fan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanSubscription {
    pub fid: u64,
    pub notification: Option<NotificationDetails>,
    /// Upstream team IDs the fan follows
    pub teams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    pub id: String,
    pub name: String,
    pub abbreviation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    Goal,
    YellowCard,
    RedCard,
    Other,
}

/// An in-match event reported by the provider (goal, card, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Stable identity used to detect newly-appeared incidents
    pub key: String,
    pub kind: IncidentKind,
    /// Provider type code, e.g. "14"
    pub type_id: String,
    pub clock_seconds: f64,
    /// e.g. "67'"
    pub clock_display: Option<String>,
    pub player: Option<String>,
    pub team_id: Option<String>,
}

/// Typed view of one match as fetched from the scoreboard provider.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSnapshot {
    pub match_id: String,
    pub league: String,
    pub home: TeamRef,
    pub away: TeamRef,
    pub home_score: u32,
    pub away_score: u32,
    pub status: MatchPhase,
    pub incidents: Vec<Incident>,
}

impl MatchSnapshot {
    /// Fingerprint of the incident list: the JSON array of incident keys.
    pub fn details_hash(&self) -> String {
        let keys: Vec<&str> = self.incidents.iter().map(|i| i.key.as_str()).collect();
        serde_json::to_string(&keys).unwrap_or_default()
    }

    pub fn team_ids(&self) -> [&str; 2] {
        [self.home.id.as_str(), self.away.id.as_str()]
    }

    pub fn team_name(&self, team_id: Option<&str>) -> Option<&str> {
        match team_id {
            Some(id) if id == self.home.id => Some(&self.home.name),
            Some(id) if id == self.away.id => Some(&self.away.name),
            _ => None,
        }
    }
}
