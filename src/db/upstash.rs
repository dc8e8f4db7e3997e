//! Upstash Redis REST backend.
//!
//! Every command is a JSON array POSTed to the database's REST URL, e.g.
//! `["GET", "fanzone:match:701234"]`, answered with `{"result": ...}` or
//! `{"error": "..."}`.
//!
//! Key layout (with the configured prefix):
//! ```text
//!  {prefix}:match:{audience}:{id} JSON MatchState
//!  {prefix}:notifications:{fid}   JSON NotificationDetails
//!  {prefix}:teams:{fid}           JSON array of team ids
//!  {prefix}:team-fans:{team_id}   SET of fids
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::models::{Audience, MatchState, NotificationDetails, Recipient};
use super::store::StateStore;

/// Writes ARGV[2] to KEYS[1] only if the stored `version` equals ARGV[1]
/// (or the key is absent when ARGV[1] is empty). Returns 1 on write.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if cur then return 0 end
else
  if not cur then return 0 end
  local ver = cjson.decode(cur)['version']
  if tostring(ver) ~= ARGV[1] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Replaces fan ARGV[1]'s followed teams with ARGV[4..] in one step: drops
/// the fid from the fan sets (prefix ARGV[2]) of teams no longer followed,
/// adds it to the new ones and stores ARGV[3] at KEYS[1] (deleted when the
/// list is empty).
const SET_TEAMS_SCRIPT: &str = r#"
local fid = ARGV[1]
local fans = ARGV[2]
local wanted = {}
for i = 4, #ARGV do wanted[ARGV[i]] = true end
local cur = redis.call('GET', KEYS[1])
if cur then
  for _, team in ipairs(cjson.decode(cur)) do
    if not wanted[team] then redis.call('SREM', fans .. team, fid) end
  end
end
for i = 4, #ARGV do redis.call('SADD', fans .. ARGV[i], fid) end
if #ARGV < 4 then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

const SCAN_PAGE_SIZE: &str = "200";

#[derive(Clone)]
pub struct UpstashStore {
    http: Client,
    rest_url: String,
    token: String,
    prefix: String,
}

impl UpstashStore {
    pub fn new(rest_url: &str, token: &str, prefix: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(UpstashStore {
            http,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            prefix: prefix.to_string(),
        })
    }

    fn match_key(&self, match_id: &str, audience: Audience) -> String {
        format!("{}:match:{}:{}", self.prefix, audience.as_str(), match_id)
    }

    fn notifications_key(&self, fid: u64) -> String {
        format!("{}:notifications:{}", self.prefix, fid)
    }

    fn teams_key(&self, fid: u64) -> String {
        format!("{}:teams:{}", self.prefix, fid)
    }

    fn team_fans_prefix(&self) -> String {
        format!("{}:team-fans:", self.prefix)
    }

    fn team_fans_key(&self, team_id: &str) -> String {
        format!("{}{}", self.team_fans_prefix(), team_id)
    }

    /// Run one command and return its `result` value.
    async fn command(&self, args: Vec<String>) -> Result<Value> {
        debug!("Upstash command: {}", args.first().map(String::as_str).unwrap_or(""));
        let resp = self
            .http
            .post(&self.rest_url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .context("Upstash request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("Failed to parse Upstash response")?;
        parse_command_response(status.is_success(), status.as_u16(), body)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        let value = self.command(vec!["GET".into(), key.clone()]).await?;
        decode_string_value(&value).with_context(|| format!("Corrupt value at {}", key))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();
        loop {
            let value = self
                .command(vec![
                    "SCAN".into(),
                    cursor.clone(),
                    "MATCH".into(),
                    pattern.to_string(),
                    "COUNT".into(),
                    SCAN_PAGE_SIZE.into(),
                ])
                .await?;
            let (next, page) = parse_scan_page(&value)?;
            keys.extend(page);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    /// Load notification details for the given fids in one MGET.
    async fn recipients_for(&self, fids: Vec<u64>) -> Result<Vec<Recipient>> {
        if fids.is_empty() {
            return Ok(vec![]);
        }
        let mut args = vec!["MGET".to_string()];
        args.extend(fids.iter().map(|fid| self.notifications_key(*fid)));
        let value = self.command(args).await?;
        let values = value
            .as_array()
            .context("MGET did not return an array")?;

        let mut recipients = Vec::new();
        for (fid, raw) in fids.into_iter().zip(values) {
            match decode_string_value::<NotificationDetails>(raw) {
                Ok(Some(details)) => recipients.push(Recipient { fid, details }),
                Ok(None) => {}
                Err(e) => warn!("Skipping fid {} with corrupt notification details: {}", fid, e),
            }
        }
        recipients.sort_by_key(|r| r.fid);
        Ok(recipients)
    }
}

#[async_trait]
impl StateStore for UpstashStore {
    async fn load_match_state(
        &self,
        match_id: &str,
        audience: Audience,
    ) -> Result<Option<MatchState>> {
        self.get_json(self.match_key(match_id, audience)).await
    }

    async fn save_match_state(
        &self,
        state: &MatchState,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        let key = self.match_key(&state.match_id, state.audience);
        let value = self
            .command(compare_and_set_command(key, state, expected_version)?)
            .await?;
        Ok(script_wrote(&value))
    }

    async fn list_match_states(&self) -> Result<Vec<MatchState>> {
        let keys = self.scan_keys(&format!("{}:match:*", self.prefix)).await?;
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut args = vec!["MGET".to_string()];
        args.extend(keys);
        let value = self.command(args).await?;
        let mut states = Vec::new();
        for raw in value.as_array().context("MGET did not return an array")? {
            match decode_string_value::<MatchState>(raw) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => warn!("Skipping corrupt match state: {}", e),
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    async fn get_notification_details(&self, fid: u64) -> Result<Option<NotificationDetails>> {
        self.get_json(self.notifications_key(fid)).await
    }

    async fn set_notification_details(
        &self,
        fid: u64,
        details: &NotificationDetails,
    ) -> Result<()> {
        self.command(vec![
            "SET".into(),
            self.notifications_key(fid),
            serde_json::to_string(details)?,
        ])
        .await?;
        Ok(())
    }

    async fn delete_notification_details(&self, fid: u64) -> Result<()> {
        self.command(vec!["DEL".into(), self.notifications_key(fid)])
            .await?;
        Ok(())
    }

    async fn list_subscribers(&self) -> Result<Vec<Recipient>> {
        let prefix = format!("{}:notifications:", self.prefix);
        let keys = self.scan_keys(&format!("{}*", prefix)).await?;
        let fids = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.parse().ok())
            .collect();
        self.recipients_for(fids).await
    }

    async fn get_team_preferences(&self, fid: u64) -> Result<Vec<String>> {
        Ok(self
            .get_json::<Vec<String>>(self.teams_key(fid))
            .await?
            .unwrap_or_default())
    }

    async fn set_team_preferences(&self, fid: u64, teams: &[String]) -> Result<()> {
        let args = set_teams_command(self.teams_key(fid), &self.team_fans_prefix(), fid, teams)?;
        let value = self.command(args).await?;
        if !script_wrote(&value) {
            anyhow::bail!("Team preferences script returned {}", value);
        }
        Ok(())
    }

    async fn delete_team_preferences(&self, fid: u64) -> Result<()> {
        self.set_team_preferences(fid, &[]).await
    }

    async fn list_team_subscribers(&self, team_ids: &[&str]) -> Result<Vec<Recipient>> {
        if team_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut args = vec!["SUNION".to_string()];
        args.extend(team_ids.iter().map(|t| self.team_fans_key(t)));
        let value = self.command(args).await?;
        let fids = value
            .as_array()
            .context("SUNION did not return an array")?
            .iter()
            .filter_map(|v| v.as_str()?.parse().ok())
            .collect();
        self.recipients_for(fids).await
    }

    fn name(&self) -> &str {
        "upstash"
    }
}

/// `EVAL` of `COMPARE_AND_SET_SCRIPT` for one match state. An empty expected
/// version means "only if absent".
fn compare_and_set_command(
    key: String,
    state: &MatchState,
    expected_version: Option<u64>,
) -> Result<Vec<String>> {
    Ok(vec![
        "EVAL".into(),
        COMPARE_AND_SET_SCRIPT.into(),
        "1".into(),
        key,
        expected_version.map(|v| v.to_string()).unwrap_or_default(),
        serde_json::to_string(state)?,
    ])
}

/// `EVAL` of `SET_TEAMS_SCRIPT` replacing a fan's followed teams.
fn set_teams_command(
    teams_key: String,
    fans_prefix: &str,
    fid: u64,
    teams: &[String],
) -> Result<Vec<String>> {
    let mut args = vec![
        "EVAL".into(),
        SET_TEAMS_SCRIPT.into(),
        "1".into(),
        teams_key,
        fid.to_string(),
        fans_prefix.to_string(),
        serde_json::to_string(teams)?,
    ];
    args.extend(teams.iter().cloned());
    Ok(args)
}

/// Both scripts answer 1 when they wrote.
fn script_wrote(value: &Value) -> bool {
    value.as_i64() == Some(1)
}

fn parse_command_response(success: bool, status: u16, body: Value) -> Result<Value> {
    if let Some(err) = body.get("error").and_then(Value::as_str) {
        anyhow::bail!("Upstash error {}: {}", status, err);
    }
    if !success {
        anyhow::bail!("Upstash error {}: {}", status, body);
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

/// Decode a JSON document stored as a Redis string value (`null` = missing key).
fn decode_string_value<T: DeserializeOwned>(value: &Value) -> Result<Option<T>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(serde_json::from_str(s)?)),
        other => anyhow::bail!("expected string value, got {}", other),
    }
}

/// `SCAN` answers `[next_cursor, [key, ...]]`.
fn parse_scan_page(value: &Value) -> Result<(String, Vec<String>)> {
    let arr = value.as_array().context("SCAN did not return an array")?;
    let cursor = match arr.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => anyhow::bail!("SCAN response missing cursor"),
    };
    let keys = arr
        .get(1)
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok((cursor, keys))
}
