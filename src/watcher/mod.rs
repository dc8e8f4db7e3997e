//! Poll-diff-persist-notify cycle for live matches.
//!
//! Each cycle fetches the scoreboard once, then walks its matches one at a
//! time:
//! ```text
//!  load stored MatchState ─▶ detect transitions ─▶ resolve recipients
//!        ─▶ versioned save (claims the transitions) ─▶ batched fan-out
//! ```
//! Stored state is per audience, so the all-fans and team cycles each
//! announce every transition once. Only a scoreboard failure aborts the
//! cycle. Store errors skip one match; delivery errors skip one recipient.

pub mod messages;
pub mod transitions;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use crate::db::models::Audience;
use crate::db::models::{MatchSnapshot, MatchState, Recipient};
use crate::db::StateStore;
use crate::error::WatchError;
use crate::live_scores::ScoreboardSource;
use crate::notify::{fan_out, FanOutReport, NotificationSender, DEFAULT_BATCH_SIZE};

use messages::format_notification;
use transitions::{detect_transitions, first_observation, Transition};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub match_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub recipients: usize,
    pub delivered: usize,
}

/// Result of one polling cycle, returned to whoever triggered it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub audience: Audience,
    pub matches_seen: usize,
    pub matches_skipped: usize,
    pub matches_seeded: usize,
    pub conflicts: usize,
    pub store_errors: usize,
    pub transitions: Vec<TransitionRecord>,
    pub notifications: FanOutReport,
}

pub struct MatchEventWatcher {
    source: Arc<dyn ScoreboardSource>,
    store: Arc<dyn StateStore>,
    sender: Arc<dyn NotificationSender>,
    /// Frame URL opened when a notification is tapped
    target_url: String,
    batch_size: usize,
}

impl MatchEventWatcher {
    pub fn new(
        source: Arc<dyn ScoreboardSource>,
        store: Arc<dyn StateStore>,
        sender: Arc<dyn NotificationSender>,
        target_url: impl Into<String>,
    ) -> Self {
        MatchEventWatcher {
            source,
            store,
            sender,
            target_url: target_url.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one full polling cycle.
    pub async fn run_cycle(&self, audience: Audience) -> Result<CycleSummary, WatchError> {
        let board = self
            .source
            .fetch_scoreboard()
            .await
            .map_err(WatchError::Scoreboard)?;

        let mut summary = CycleSummary {
            audience,
            matches_skipped: board.skipped.len(),
            ..Default::default()
        };
        for skipped in &board.skipped {
            warn!(
                "Skipping {} match {}: {}",
                self.source.name(),
                skipped.match_id.as_deref().unwrap_or("?"),
                skipped.reason
            );
        }

        for snapshot in &board.matches {
            summary.matches_seen += 1;
            if let Err(e) = self.process_match(snapshot, audience, &mut summary).await {
                summary.store_errors += 1;
                warn!("Match {} not processed: {:#}", snapshot.match_id, e);
            }
        }

        info!(
            "Cycle done via {}/{}: {} matches, {} transitions, {}/{} delivered",
            self.source.name(),
            self.store.name(),
            summary.matches_seen,
            summary.transitions.len(),
            summary.notifications.delivered,
            summary.notifications.attempted
        );
        Ok(summary)
    }

    async fn process_match(
        &self,
        snapshot: &MatchSnapshot,
        audience: Audience,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let previous = self
            .store
            .load_match_state(&snapshot.match_id, audience)
            .await
            .context("loading match state")?;

        let (transitions, next, expected_version) = match &previous {
            None => (
                first_observation(snapshot),
                MatchState::seed(snapshot, audience),
                None,
            ),
            Some(prev) => (
                detect_transitions(prev, snapshot),
                prev.advance(snapshot),
                Some(prev.version),
            ),
        };

        let recipients = if transitions.is_empty() {
            Vec::new()
        } else {
            self.recipients(snapshot, audience)
                .await
                .context("listing subscribers")?
        };

        // Whoever lands this write owns the transitions; a concurrent cycle
        // that read the same version gets `false` and stays quiet.
        let claimed = self
            .store
            .save_match_state(&next, expected_version)
            .await
            .context("saving match state")?;
        if !claimed {
            summary.conflicts += 1;
            warn!(
                "Match {} was updated by a concurrent cycle; skipping {} transition(s)",
                snapshot.match_id,
                transitions.len()
            );
            return Ok(());
        }
        if previous.is_none() {
            summary.matches_seeded += 1;
        }

        for transition in &transitions {
            self.announce(snapshot, transition, &recipients, summary).await;
        }
        Ok(())
    }

    async fn recipients(&self, snapshot: &MatchSnapshot, audience: Audience) -> Result<Vec<Recipient>> {
        match audience {
            Audience::All => self.store.list_subscribers().await,
            Audience::Team => self.store.list_team_subscribers(&snapshot.team_ids()).await,
        }
    }

    async fn announce(
        &self,
        snapshot: &MatchSnapshot,
        transition: &Transition,
        recipients: &[Recipient],
        summary: &mut CycleSummary,
    ) {
        let notification = format_notification(snapshot, transition, &self.target_url);
        info!(
            "{} in {} ({} vs {}): '{}' → {} recipient(s)",
            transition.kind(),
            snapshot.match_id,
            snapshot.home.name,
            snapshot.away.name,
            notification.title,
            recipients.len()
        );

        let report = fan_out(self.sender.as_ref(), recipients, &notification, self.batch_size).await;
        summary.notifications.merge(report);
        summary.transitions.push(TransitionRecord {
            match_id: snapshot.match_id.clone(),
            kind: transition.kind().to_string(),
            title: notification.title,
            body: notification.body,
            recipients: recipients.len(),
            delivered: report.delivered,
        });
    }
}

/// Spawns the in-process scheduler: one cycle every `interval`, plus up to
/// `max_jitter` of random delay before each cycle.
pub fn spawn_poll_loop(
    watcher: Arc<MatchEventWatcher>,
    audience: Audience,
    interval: Duration,
    max_jitter: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Poll loop started (audience={:?}, interval={:?}, jitter<={:?})",
            audience, interval, max_jitter
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let jitter_ms = match max_jitter.as_millis() as u64 {
                0 => 0,
                max => rand::thread_rng().gen_range(0..=max),
            };
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            if let Err(e) = watcher.run_cycle(audience).await {
                error!("Polling cycle failed: {}", e);
            }
        }
    })
}
