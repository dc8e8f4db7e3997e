use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::provider::{Scoreboard, ScoreboardSource, SkippedMatch};
use crate::db::models::{Incident, IncidentKind, MatchPhase, MatchSnapshot, TeamRef};

pub const DEFAULT_SCOREBOARD_URL: &str =
    "https://site.api.espn.com/apis/site/v2/sports/soccer/eng.1/scoreboard";

// Provider incident type codes. These come from the upstream taxonomy and are
// not documented anywhere; the boolean flags on each detail are honoured too.
const GOAL_TYPE_ID: &str = "5";
const YELLOW_CARD_TYPE_ID: &str = "14";
const RED_CARD_TYPE_ID: &str = "15";

/// Scoreboard provider backed by ESPN's public site API (no key required).
pub struct EspnScoreboard {
    http: Client,
    url: String,
}

impl EspnScoreboard {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(EspnScoreboard {
            http,
            url: url.to_string(),
        })
    }

    /// Map ESPN's `status.type` onto a match phase. `None` for events that
    /// will not be played (postponed, cancelled, ...) or are unrecognisable.
    fn phase_from_status(state: Option<&str>, name: Option<&str>, completed: bool) -> Option<MatchPhase> {
        let name = name.unwrap_or_default().to_uppercase();
        if ["POSTPONED", "CANCELED", "CANCELLED", "ABANDONED", "SUSPENDED", "FORFEIT"]
            .iter()
            .any(|s| name.contains(s))
        {
            return None;
        }
        if name == "STATUS_HALFTIME" {
            return Some(MatchPhase::Halftime);
        }
        if completed {
            return Some(MatchPhase::FullTime);
        }
        match state.map(str::to_lowercase).as_deref() {
            Some("pre") => Some(MatchPhase::Scheduled),
            Some("in") => Some(MatchPhase::InProgress),
            Some("post") => Some(MatchPhase::FullTime),
            _ if name == "STATUS_SCHEDULED" => Some(MatchPhase::Scheduled),
            _ if name == "STATUS_FULL_TIME" || name == "STATUS_FINAL" => Some(MatchPhase::FullTime),
            _ => None,
        }
    }
}

#[async_trait]
impl ScoreboardSource for EspnScoreboard {
    fn name(&self) -> &str {
        "ESPN"
    }

    async fn fetch_scoreboard(&self) -> Result<Scoreboard> {
        debug!("Fetching scoreboard from {}", self.url);

        let resp = self.http.get(&self.url).send().await
            .context("ESPN scoreboard request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("ESPN scoreboard error: {}", resp.status());
        }

        let raw: Value = resp.json().await
            .context("Failed to parse ESPN scoreboard response")?;

        parse_scoreboard(raw)
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawScoreboard {
    #[serde(default)]
    leagues: Vec<EspnLeague>,
    /// Decoded one by one so a single bad event only skips that match
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct EspnLeague {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnEvent {
    id: String,
    #[serde(default)]
    competitions: Vec<EspnCompetition>,
    #[serde(default)]
    status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
struct EspnCompetition {
    #[serde(default)]
    competitors: Vec<EspnCompetitor>,
    #[serde(default)]
    details: Vec<EspnDetail>,
    #[serde(default)]
    status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
struct EspnCompetitor {
    #[serde(rename = "homeAway", default)]
    home_away: Option<String>,
    #[serde(default)]
    score: Option<ScoreField>,
    #[serde(default)]
    team: Option<EspnTeam>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScoreField {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct EspnTeam {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(rename = "shortDisplayName", default)]
    short_display_name: Option<String>,
    #[serde(default)]
    abbreviation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnStatus {
    #[serde(rename = "type", default)]
    status_type: Option<EspnStatusType>,
}

#[derive(Debug, Deserialize)]
struct EspnStatusType {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    completed: bool,
}

#[derive(Debug, Deserialize)]
struct EspnDetail {
    #[serde(rename = "type", default)]
    detail_type: Option<EspnDetailType>,
    #[serde(default)]
    clock: Option<EspnClock>,
    #[serde(default)]
    team: Option<EspnTeamId>,
    #[serde(rename = "athletesInvolved", default)]
    athletes_involved: Vec<EspnAthlete>,
    #[serde(rename = "scoringPlay", default)]
    scoring_play: bool,
    #[serde(rename = "yellowCard", default)]
    yellow_card: bool,
    #[serde(rename = "redCard", default)]
    red_card: bool,
}

#[derive(Debug, Deserialize)]
struct EspnDetailType {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnClock {
    #[serde(default)]
    value: Option<f64>,
    #[serde(rename = "displayValue", default)]
    display_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnTeamId {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnAthlete {
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

// ── Decoding ─────────────────────────────────────────────────────────────────

fn parse_scoreboard(raw: Value) -> Result<Scoreboard> {
    let raw: RawScoreboard =
        serde_json::from_value(raw).context("Unexpected ESPN scoreboard shape")?;
    let league = raw
        .leagues
        .first()
        .and_then(|l| l.name.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let mut board = Scoreboard::default();
    for value in raw.events {
        let match_id = value["id"].as_str().map(str::to_string);
        let decoded = serde_json::from_value::<EspnEvent>(value)
            .map_err(|e| format!("malformed event: {}", e))
            .and_then(|ev| event_to_snapshot(ev, &league));
        match decoded {
            Ok(snapshot) => board.matches.push(snapshot),
            Err(reason) => board.skipped.push(SkippedMatch { match_id, reason }),
        }
    }
    Ok(board)
}

fn event_to_snapshot(ev: EspnEvent, league: &str) -> std::result::Result<MatchSnapshot, String> {
    let competition = ev
        .competitions
        .into_iter()
        .next()
        .ok_or("no competition")?;

    let mut home = None;
    let mut away = None;
    for competitor in competition.competitors {
        match competitor.home_away.as_deref() {
            Some("home") => home = Some(competitor),
            Some("away") => away = Some(competitor),
            _ => {}
        }
    }
    let (home_team, home_score) = decode_competitor(home.ok_or("missing home competitor")?)?;
    let (away_team, away_score) = decode_competitor(away.ok_or("missing away competitor")?)?;

    let status_type = competition
        .status
        .or(ev.status)
        .and_then(|s| s.status_type)
        .ok_or("missing status")?;
    let status = EspnScoreboard::phase_from_status(
        status_type.state.as_deref(),
        status_type.name.as_deref(),
        status_type.completed,
    )
    .ok_or_else(|| format!("unplayable status {:?}", status_type.name))?;

    let incidents = competition.details.into_iter().map(decode_incident).collect();

    Ok(MatchSnapshot {
        match_id: ev.id,
        league: league.to_string(),
        home: home_team,
        away: away_team,
        home_score,
        away_score,
        status,
        incidents,
    })
}

fn decode_competitor(c: EspnCompetitor) -> std::result::Result<(TeamRef, u32), String> {
    let team = c.team.ok_or("competitor without team")?;
    let id = team.id.ok_or("team without id")?;
    let name = team
        .display_name
        .or(team.short_display_name)
        .ok_or_else(|| format!("team {} without name", id))?;
    let abbreviation = team.abbreviation.unwrap_or_else(|| name.clone());
    let score = match c.score {
        None => 0,
        Some(ScoreField::Number(n)) => n,
        Some(ScoreField::Text(s)) if s.trim().is_empty() => 0,
        Some(ScoreField::Text(s)) => s
            .trim()
            .parse()
            .map_err(|_| format!("team {} has non-numeric score '{}'", id, s))?,
    };
    Ok((
        TeamRef {
            id,
            name,
            abbreviation,
        },
        score,
    ))
}

fn classify_incident(type_id: &str, detail: &EspnDetail) -> IncidentKind {
    if detail.red_card || type_id == RED_CARD_TYPE_ID {
        IncidentKind::RedCard
    } else if detail.yellow_card || type_id == YELLOW_CARD_TYPE_ID {
        IncidentKind::YellowCard
    } else if detail.scoring_play || type_id == GOAL_TYPE_ID {
        IncidentKind::Goal
    } else {
        IncidentKind::Other
    }
}

fn decode_incident(detail: EspnDetail) -> Incident {
    let type_id = detail
        .detail_type
        .as_ref()
        .and_then(|t| t.id.clone())
        .unwrap_or_default();
    let kind = classify_incident(&type_id, &detail);
    let clock_seconds = detail.clock.as_ref().and_then(|c| c.value).unwrap_or(0.0);
    let clock_display = detail.clock.and_then(|c| c.display_value);
    let team_id = detail.team.and_then(|t| t.id);
    let player = detail
        .athletes_involved
        .into_iter()
        .find_map(|a| a.display_name);
    let key = format!(
        "{}:{}:{}:{}",
        type_id,
        clock_seconds,
        team_id.as_deref().unwrap_or(""),
        player.as_deref().unwrap_or("")
    );
    Incident {
        key,
        kind,
        type_id,
        clock_seconds,
        clock_display,
        player,
        team_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;

    /// Serves `body` with `status` at a local scoreboard URL.
    async fn serve_scoreboard(status: StatusCode, body: Value) -> String {
        let app = Router::new().route(
            "/scoreboard",
            get(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/scoreboard", addr)
    }

    fn competitor(home_away: &str, id: &str, name: &str, abbr: &str, score: &str) -> Value {
        json!({
            "homeAway": home_away,
            "score": score,
            "team": { "id": id, "displayName": name, "abbreviation": abbr }
        })
    }

    fn event(id: &str, state: &str, name: &str, details: Value) -> Value {
        json!({
            "id": id,
            "competitions": [{
                "competitors": [
                    competitor("home", "359", "Arsenal", "ARS", "2"),
                    competitor("away", "363", "Chelsea", "CHE", "1"),
                ],
                "details": details,
                "status": { "type": { "name": name, "state": state, "completed": false } }
            }]
        })
    }

    #[test]
    fn test_parse_full_event() {
        let raw = json!({
            "leagues": [{ "name": "English Premier League" }],
            "events": [event("701234", "in", "STATUS_SECOND_HALF", json!([
                {
                    "type": { "id": "5", "text": "Goal" },
                    "clock": { "value": 1260.0, "displayValue": "21'" },
                    "team": { "id": "359" },
                    "scoringPlay": true,
                    "athletesInvolved": [{ "displayName": "Bukayo Saka" }]
                },
                {
                    "type": { "id": "14", "text": "Yellow Card" },
                    "clock": { "value": 2400.0, "displayValue": "40'" },
                    "team": { "id": "363" },
                    "athletesInvolved": [{ "displayName": "Enzo Fernandez" }]
                }
            ]))]
        });

        let board = parse_scoreboard(raw).unwrap();
        assert!(board.skipped.is_empty());
        let m = &board.matches[0];
        assert_eq!(m.match_id, "701234");
        assert_eq!(m.league, "English Premier League");
        assert_eq!(m.home.abbreviation, "ARS");
        assert_eq!((m.home_score, m.away_score), (2, 1));
        assert_eq!(m.status, MatchPhase::InProgress);
        assert_eq!(m.incidents.len(), 2);
        assert_eq!(m.incidents[0].kind, IncidentKind::Goal);
        assert_eq!(m.incidents[0].player.as_deref(), Some("Bukayo Saka"));
        assert_eq!(m.incidents[0].key, "5:1260:359:Bukayo Saka");
        assert_eq!(m.incidents[1].kind, IncidentKind::YellowCard);
    }

    #[test]
    fn test_bad_competitors_skip_only_that_match() {
        let broken = json!({
            "id": "2",
            "competitions": [{
                "competitors": [competitor("home", "359", "Arsenal", "ARS", "0")],
                "status": { "type": { "state": "in" } }
            }]
        });
        let bad_score = json!({
            "id": "3",
            "competitions": [{
                "competitors": [
                    competitor("home", "359", "Arsenal", "ARS", "one"),
                    competitor("away", "363", "Chelsea", "CHE", "0"),
                ],
                "status": { "type": { "state": "in" } }
            }]
        });
        let raw = json!({
            "events": [event("1", "pre", "STATUS_SCHEDULED", json!([])), broken, bad_score, 42]
        });

        let board = parse_scoreboard(raw).unwrap();
        assert_eq!(board.matches.len(), 1);
        assert_eq!(board.matches[0].status, MatchPhase::Scheduled);
        assert_eq!(board.skipped.len(), 3);
        assert_eq!(board.skipped[0].match_id.as_deref(), Some("2"));
        assert!(board.skipped[0].reason.contains("away"));
        assert!(board.skipped[2].match_id.is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(parse_scoreboard(json!([1, 2, 3])).is_err());
        assert!(parse_scoreboard(json!({ "events": "nope" })).is_err());
        assert!(parse_scoreboard(json!({})).unwrap().matches.is_empty());
    }

    #[test]
    fn test_phase_from_status() {
        use MatchPhase::*;
        let phase = EspnScoreboard::phase_from_status;
        assert_eq!(phase(Some("pre"), Some("STATUS_SCHEDULED"), false), Some(Scheduled));
        assert_eq!(phase(Some("in"), Some("STATUS_FIRST_HALF"), false), Some(InProgress));
        assert_eq!(phase(Some("in"), Some("STATUS_HALFTIME"), false), Some(Halftime));
        assert_eq!(phase(Some("post"), Some("STATUS_FULL_TIME"), true), Some(FullTime));
        assert_eq!(phase(None, Some("STATUS_FINAL"), false), Some(FullTime));
        assert_eq!(phase(Some("post"), Some("STATUS_POSTPONED"), false), None);
        assert_eq!(phase(None, None, false), None);
    }

    #[test]
    fn test_classify_incident_by_flag_or_type() {
        let detail: EspnDetail = serde_json::from_value(json!({
            "type": { "id": "94" }, "redCard": true
        }))
        .unwrap();
        assert_eq!(classify_incident("94", &detail), IncidentKind::RedCard);

        let detail: EspnDetail = serde_json::from_value(json!({ "type": { "id": "15" } })).unwrap();
        assert_eq!(decode_incident(detail).kind, IncidentKind::RedCard);

        let detail: EspnDetail = serde_json::from_value(json!({ "type": { "id": "99" } })).unwrap();
        assert_eq!(decode_incident(detail).kind, IncidentKind::Other);
    }

    #[tokio::test]
    async fn test_fetch_scoreboard_decodes_success() {
        let url = serve_scoreboard(
            StatusCode::OK,
            json!({ "events": [event("1", "pre", "STATUS_SCHEDULED", json!([]))] }),
        )
        .await;
        let board = EspnScoreboard::new(&url).unwrap().fetch_scoreboard().await.unwrap();
        assert_eq!(board.matches.len(), 1);
        assert_eq!(board.matches[0].match_id, "1");
    }

    #[tokio::test]
    async fn test_fetch_scoreboard_rejects_non_2xx() {
        let url = serve_scoreboard(StatusCode::SERVICE_UNAVAILABLE, json!({ "events": [] })).await;
        let err = EspnScoreboard::new(&url).unwrap().fetch_scoreboard().await.unwrap_err();
        assert!(err.to_string().contains("503"), "{}", err);
    }

    #[tokio::test]
    async fn test_upstream_error_fails_the_cycle_without_writes() {
        use crate::db::Database;
        use crate::error::WatchError;
        use crate::notify::testing::RecordingSender;
        use crate::watcher::{Audience, MatchEventWatcher};
        use std::sync::Arc;

        let url = serve_scoreboard(StatusCode::BAD_GATEWAY, json!({})).await;
        let db = Database::open(":memory:").unwrap();
        let watcher = MatchEventWatcher::new(
            Arc::new(EspnScoreboard::new(&url).unwrap()),
            Arc::new(db.clone()),
            Arc::new(RecordingSender::default()),
            "https://frame.example",
        );

        let err = watcher.run_cycle(Audience::All).await.unwrap_err();
        assert!(matches!(err, WatchError::Scoreboard(_)));
        assert!(db.all_match_states().unwrap().is_empty());
    }
}
