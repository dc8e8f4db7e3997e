//! Farcaster frame webhook decoding.
//!
//! Clients POST a JSON Farcaster Signature envelope whose parts are
//! base64url-encoded JSON:
//! ```text
//!  { "header": b64({fid, type, key}), "payload": b64({event, ...}), "signature": b64(..) }
//! ```
//! The app-key signature is not verified here.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::db::models::NotificationDetails;

#[derive(Debug, Deserialize)]
struct SignedEnvelope {
    header: String,
    payload: String,
    #[allow(dead_code)]
    signature: String,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    fid: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FrameEvent {
    #[serde(alias = "miniapp_added")]
    FrameAdded {
        #[serde(rename = "notificationDetails", default)]
        notification_details: Option<NotificationDetails>,
    },
    #[serde(alias = "miniapp_removed")]
    FrameRemoved {},
    NotificationsEnabled {
        #[serde(rename = "notificationDetails")]
        notification_details: NotificationDetails,
    },
    NotificationsDisabled {},
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub fid: u64,
    pub event: FrameEvent,
}

pub fn decode_webhook(body: &[u8]) -> Result<WebhookEvent, String> {
    let envelope: SignedEnvelope =
        serde_json::from_slice(body).map_err(|e| format!("invalid envelope: {}", e))?;
    let header: EnvelopeHeader = decode_part(&envelope.header, "header")?;
    let event: FrameEvent = decode_part(&envelope.payload, "payload")?;
    Ok(WebhookEvent {
        fid: header.fid,
        event,
    })
}

fn decode_part<T: DeserializeOwned>(part: &str, what: &str) -> Result<T, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part.trim_end_matches('='))
        .map_err(|e| format!("{} is not base64url: {}", what, e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid {}: {}", what, e))
}

#[cfg(test)]
pub(crate) fn encode_envelope(fid: u64, payload: serde_json::Value) -> String {
    let header = serde_json::json!({ "fid": fid, "type": "app_key", "key": "0xabc" });
    serde_json::json!({
        "header": URL_SAFE_NO_PAD.encode(header.to_string()),
        "payload": URL_SAFE_NO_PAD.encode(payload.to_string()),
        "signature": URL_SAFE_NO_PAD.encode("sig"),
    })
    .to_string()
}
