//! Notification delivery and batched fan-out.
//!
//! A single logical notification is delivered to many recipients in
//! fixed-size batches: every delivery inside a batch runs concurrently, and a
//! batch is awaited in full before the next one starts. One recipient failing
//! never affects the others.

pub mod frame;

pub use frame::FrameNotifier;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::models::Recipient;

pub const DEFAULT_BATCH_SIZE: usize = 40;

/// One formatted message ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Stable identity; clients drop repeats of the same id
    pub notification_id: String,
    pub title: String,
    pub body: String,
    pub target_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The recipient's client throttled us; not retried at this layer
    RateLimited,
    Failed(String),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver to one recipient. `Err` is a transport failure and is
    /// counted like `DeliveryOutcome::Failed`.
    async fn deliver(&self, recipient: &Recipient, notification: &Notification)
        -> Result<DeliveryOutcome>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub batches: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub rate_limited: usize,
    pub failed: usize,
}

impl FanOutReport {
    pub fn merge(&mut self, other: FanOutReport) {
        self.batches += other.batches;
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.rate_limited += other.rate_limited;
        self.failed += other.failed;
    }
}

/// Deliver `notification` to every recipient, `batch_size` at a time.
pub async fn fan_out(
    sender: &dyn NotificationSender,
    recipients: &[Recipient],
    notification: &Notification,
    batch_size: usize,
) -> FanOutReport {
    let mut report = FanOutReport::default();

    for (index, batch) in recipients.chunks(batch_size.max(1)).enumerate() {
        debug!(
            "Delivering '{}' batch {} ({} recipients)",
            notification.notification_id,
            index + 1,
            batch.len()
        );
        let results = join_all(batch.iter().map(|r| sender.deliver(r, notification))).await;

        report.batches += 1;
        for (recipient, result) in batch.iter().zip(results) {
            report.attempted += 1;
            match result {
                Ok(DeliveryOutcome::Delivered) => report.delivered += 1,
                Ok(DeliveryOutcome::RateLimited) => {
                    report.rate_limited += 1;
                    warn!("Rate limited delivering to fid {}", recipient.fid);
                }
                Ok(DeliveryOutcome::Failed(reason)) => {
                    report.failed += 1;
                    warn!("Delivery to fid {} rejected: {}", recipient.fid, reason);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Delivery to fid {} failed: {:#}", recipient.fid, e);
                }
            }
        }
    }

    report
}
