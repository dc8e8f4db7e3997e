use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod api;
mod config;
mod db;
mod error;
mod live_scores;
mod notify;
mod watcher;

use api::AppState;
use config::Config;
use db::{Database, StateStore, UpstashStore};
use live_scores::{EspnScoreboard, ScoreboardSource};
use notify::FrameNotifier;
use watcher::{spawn_poll_loop, MatchEventWatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Shared state store: Upstash when configured, local SQLite otherwise
    let store: Arc<dyn StateStore> = match (&config.upstash_url, &config.upstash_token) {
        (Some(url), Some(token)) => Arc::new(UpstashStore::new(url, token, &config.key_prefix)?),
        _ => Arc::new(Database::open(&config.database_path)?),
    };
    info!("State store: {}", store.name());

    let source: Arc<dyn ScoreboardSource> = Arc::new(EspnScoreboard::new(&config.scoreboard_url)?);
    info!("Scoreboard source: {} ({})", source.name(), config.scoreboard_url);

    let watcher = Arc::new(
        MatchEventWatcher::new(
            source,
            store.clone(),
            Arc::new(FrameNotifier::new()?),
            config.app_url.clone(),
        )
        .with_batch_size(config.batch_size),
    );

    if config.run_once {
        let summary = watcher.run_cycle(config.poll_audience).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if config.poll_interval_secs > 0 {
        spawn_poll_loop(
            watcher.clone(),
            config.poll_audience,
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_millis(config.poll_jitter_ms),
        );
    } else {
        info!("In-process polling disabled; cycles run when the trigger endpoints are called");
    }

    let app = api::router(AppState {
        watcher,
        store,
        api_key: config.api_key.clone().unwrap_or_default(),
    });
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
