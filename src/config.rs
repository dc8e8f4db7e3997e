use clap::Parser;
use url::Url;

use crate::live_scores::espn::DEFAULT_SCOREBOARD_URL;
use crate::watcher::Audience;

/// Football match-event watcher with Farcaster frame notifications
#[derive(Parser, Debug, Clone)]
#[command(name = "matchday-notifier", version, about)]
pub struct Config {
    /// HTTP listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// API key expected in the x-api-key header of trigger/preferences calls
    #[arg(long, env = "NOTIFIER_API_KEY")]
    pub api_key: Option<String>,

    /// Scoreboard URL (ESPN site API)
    #[arg(long, env = "SCOREBOARD_URL", default_value = DEFAULT_SCOREBOARD_URL)]
    pub scoreboard_url: String,

    /// Frame URL opened when a notification is tapped
    #[arg(long, env = "APP_URL", default_value = "http://localhost:3000")]
    pub app_url: String,

    /// SQLite database path (used unless Upstash is configured)
    #[arg(long, env = "DATABASE_PATH", default_value = "matchday.db")]
    pub database_path: String,

    /// Upstash Redis REST URL
    #[arg(long, env = "UPSTASH_REDIS_REST_URL")]
    pub upstash_url: Option<String>,

    /// Upstash Redis REST token
    #[arg(long, env = "UPSTASH_REDIS_REST_TOKEN")]
    pub upstash_token: Option<String>,

    /// Key prefix for records in Upstash
    #[arg(long, env = "KEY_PREFIX", default_value = "fanzone")]
    pub key_prefix: String,

    /// Recipients notified concurrently per batch
    #[arg(long, env = "BATCH_SIZE", default_value = "40")]
    pub batch_size: usize,

    /// In-process polling interval in seconds (0 = only poll when triggered over HTTP)
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "0")]
    pub poll_interval_secs: u64,

    /// Maximum random delay added to each in-process poll, in milliseconds
    #[arg(long, env = "POLL_JITTER_MS", default_value = "2000")]
    pub poll_jitter_ms: u64,

    /// Audience for in-process polls and --run-once
    #[arg(long, env = "POLL_AUDIENCE", value_enum, default_value = "all")]
    pub poll_audience: Audience,

    /// Run a single cycle, print its summary as JSON and exit
    #[arg(long, default_value = "false")]
    pub run_once: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.run_once && self.api_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("NOTIFIER_API_KEY is required when serving the HTTP API. Use --run-once for a single local cycle.");
        }
        if self.upstash_url.is_some() != self.upstash_token.is_some() {
            anyhow::bail!("UPSTASH_REDIS_REST_URL and UPSTASH_REDIS_REST_TOKEN must be set together");
        }
        if self.batch_size == 0 || self.batch_size > 100 {
            anyhow::bail!("batch_size must be between 1 and 100");
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            anyhow::bail!("key_prefix must be non-empty and contain no whitespace");
        }
        check_http_url("SCOREBOARD_URL", &self.scoreboard_url)?;
        check_http_url("APP_URL", &self.app_url)?;
        if let Some(url) = &self.upstash_url {
            check_http_url("UPSTASH_REDIS_REST_URL", url)?;
        }
        Ok(())
    }
}

fn check_http_url(name: &str, value: &str) -> anyhow::Result<()> {
    let url = Url::parse(value).map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", name, e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("{} must be an http(s) URL", name);
    }
    Ok(())
}
