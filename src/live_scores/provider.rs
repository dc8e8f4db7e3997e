use anyhow::Result;
use async_trait::async_trait;

use crate::db::models::MatchSnapshot;

/// One upstream event that could not be turned into a `MatchSnapshot`.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedMatch {
    pub match_id: Option<String>,
    pub reason: String,
}

/// Decoded scoreboard: usable matches plus the events that were skipped.
#[derive(Debug, Clone, Default)]
pub struct Scoreboard {
    pub matches: Vec<MatchSnapshot>,
    pub skipped: Vec<SkippedMatch>,
}

/// Trait that every scoreboard provider must implement.
#[async_trait]
pub trait ScoreboardSource: Send + Sync {
    /// Fetch and decode the current scoreboard. An error here aborts the
    /// whole polling cycle.
    async fn fetch_scoreboard(&self) -> Result<Scoreboard>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
