use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DeliveryOutcome, Notification, NotificationSender};
use crate::db::models::Recipient;

/// Sends Farcaster frame notifications to the URL each client registered
/// for the fan (`POST {url}` with the fan's token).
#[derive(Clone)]
pub struct FrameNotifier {
    http: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendNotificationRequest<'a> {
    notification_id: &'a str,
    title: &'a str,
    body: &'a str,
    target_url: &'a str,
    tokens: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendNotificationResponse {
    result: SendNotificationResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendNotificationResult {
    successful_tokens: Vec<String>,
    invalid_tokens: Vec<String>,
    rate_limited_tokens: Vec<String>,
}

impl FrameNotifier {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(FrameNotifier { http })
    }
}

#[async_trait]
impl NotificationSender for FrameNotifier {
    async fn deliver(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<DeliveryOutcome> {
        let request = SendNotificationRequest {
            notification_id: &notification.notification_id,
            title: &notification.title,
            body: &notification.body,
            target_url: &notification.target_url,
            tokens: vec![recipient.details.token.as_str()],
        };

        let resp = self
            .http
            .post(&recipient.details.url)
            .json(&request)
            .send()
            .await
            .context("Notification request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Ok(DeliveryOutcome::Failed(format!("HTTP {}: {}", status, body)));
        }

        let parsed: SendNotificationResponse = resp
            .json()
            .await
            .context("Failed to parse notification response")?;
        let outcome = classify_token(&parsed.result, &recipient.details.token);
        debug!("Notification to fid {}: {:?}", recipient.fid, outcome);
        Ok(outcome)
    }
}

fn classify_token(result: &SendNotificationResult, token: &str) -> DeliveryOutcome {
    let has = |tokens: &Vec<String>| tokens.iter().any(|t| t == token);
    if has(&result.successful_tokens) {
        DeliveryOutcome::Delivered
    } else if has(&result.rate_limited_tokens) {
        DeliveryOutcome::RateLimited
    } else if has(&result.invalid_tokens) {
        DeliveryOutcome::Failed("invalid token".into())
    } else {
        DeliveryOutcome::Failed("token missing from response".into())
    }
}
