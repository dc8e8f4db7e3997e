use anyhow::Result;
use async_trait::async_trait;

use super::models::{Audience, MatchState, NotificationDetails, Recipient};

/// Key-value records the watcher and the API share.
///
/// Match states are keyed by `(match_id, audience)`.
///
/// Implementations must make `save_match_state` atomic: the write only lands
/// if the stored version still equals `expected_version` (`None` meaning the
/// record must not exist yet). This is what keeps two overlapping cycles for
/// the same audience from both notifying the same transition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_match_state(
        &self,
        match_id: &str,
        audience: Audience,
    ) -> Result<Option<MatchState>>;

    /// Writes under `state.audience`. Returns `false` when the version check
    /// fails and nothing was written.
    async fn save_match_state(
        &self,
        state: &MatchState,
        expected_version: Option<u64>,
    ) -> Result<bool>;

    async fn list_match_states(&self) -> Result<Vec<MatchState>>;

    async fn get_notification_details(&self, fid: u64) -> Result<Option<NotificationDetails>>;

    async fn set_notification_details(&self, fid: u64, details: &NotificationDetails)
        -> Result<()>;

    async fn delete_notification_details(&self, fid: u64) -> Result<()>;

    /// Every fan with notification details.
    async fn list_subscribers(&self) -> Result<Vec<Recipient>>;

    async fn get_team_preferences(&self, fid: u64) -> Result<Vec<String>>;

    /// Replace the fan's followed teams.
    async fn set_team_preferences(&self, fid: u64, teams: &[String]) -> Result<()>;

    async fn delete_team_preferences(&self, fid: u64) -> Result<()>;

    /// Fans with notification details who follow any of `team_ids`.
    async fn list_team_subscribers(&self, team_ids: &[&str]) -> Result<Vec<Recipient>>;

    /// Human-readable backend name for logging.
    fn name(&self) -> &str;
}
