pub mod webhook;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::db::models::FanSubscription;
use crate::db::StateStore;
use crate::error::ApiError;
use crate::watcher::{Audience, MatchEventWatcher};
use webhook::{decode_webhook, FrameEvent};

pub const API_KEY_HEADER: &str = "x-api-key";
const MAX_TEAMS_PER_FAN: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub watcher: Arc<MatchEventWatcher>,
    pub store: Arc<dyn StateStore>,
    pub api_key: String,
}

/// Build the Axum router for the trigger, webhook and preferences API.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);

    let protected = Router::new()
        .route("/api/goal-notification", post(goal_notification_handler))
        .route("/api/team-notification", post(team_notification_handler))
        .route("/api/matches", get(matches_handler))
        .route(
            "/api/preferences/:fid",
            get(get_preferences_handler)
                .put(put_preferences_handler)
                .delete(delete_preferences_handler),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/webhook", post(webhook_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || !keys_match(provided, &state.api_key) {
        warn!("Rejected {} {}: bad API key", request.method(), request.uri().path());
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Compares every byte instead of stopping at the first mismatch.
fn keys_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /api/goal-notification: one cycle for every subscriber
async fn goal_notification_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.watcher.run_cycle(Audience::All).await?;
    Ok(Json(summary))
}

/// POST /api/team-notification: one cycle for fans of the playing teams
async fn team_notification_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.watcher.run_cycle(Audience::Team).await?;
    Ok(Json(summary))
}

/// GET /api/matches
async fn matches_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_match_states().await?))
}

/// POST /api/webhook (frame lifecycle events from Farcaster clients)
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let ev = decode_webhook(&body).map_err(ApiError::BadRequest)?;

    match ev.event {
        FrameEvent::FrameAdded {
            notification_details: Some(details),
        }
        | FrameEvent::NotificationsEnabled {
            notification_details: details,
        } => {
            state.store.set_notification_details(ev.fid, &details).await?;
            info!("Notifications enabled for fid {}", ev.fid);
        }
        FrameEvent::FrameAdded {
            notification_details: None,
        } => {
            info!("Frame added by fid {} without notifications", ev.fid);
        }
        FrameEvent::FrameRemoved {} | FrameEvent::NotificationsDisabled {} => {
            state.store.delete_notification_details(ev.fid).await?;
            info!("Notifications disabled for fid {}", ev.fid);
        }
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct PreferencesBody {
    teams: Vec<String>,
}

async fn load_subscription(store: &dyn StateStore, fid: u64) -> Result<FanSubscription, ApiError> {
    Ok(FanSubscription {
        fid,
        notification: store.get_notification_details(fid).await?,
        teams: store.get_team_preferences(fid).await?,
    })
}

/// GET /api/preferences/:fid
async fn get_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(fid): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_subscription(state.store.as_ref(), fid).await?))
}

/// PUT /api/preferences/:fid  { "teams": ["359", ...] }
async fn put_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(fid): Path<u64>,
    Json(body): Json<PreferencesBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut teams: Vec<String> = body
        .teams
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    teams.sort();
    teams.dedup();
    if teams.len() > MAX_TEAMS_PER_FAN {
        return Err(ApiError::BadRequest(format!(
            "at most {} teams can be followed",
            MAX_TEAMS_PER_FAN
        )));
    }

    state.store.set_team_preferences(fid, &teams).await?;
    info!("fid {} now follows {} team(s)", fid, teams.len());
    Ok(Json(load_subscription(state.store.as_ref(), fid).await?))
}

/// DELETE /api/preferences/:fid
async fn delete_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(fid): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_team_preferences(fid).await?;
    info!("fid {} unsubscribed from team notifications", fid);
    Ok(Json(load_subscription(state.store.as_ref(), fid).await?))
}
