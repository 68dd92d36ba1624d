use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::expo::DEFAULT_EXPO_PUSH_URL;
use crate::policy::PolicyTable;

/// Core tunables of the scheduler.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub retry_backoff: chrono::Duration,
    // Delivery times closer than this skip the table and go straight to the sender
    pub immediate_threshold: chrono::Duration,
    pub send_timeout: Duration,
    pub terminal_retention: chrono::Duration,
    pub preferences_ttl: Duration,
    pub immediate_capacity: usize,
    pub policies: PolicyTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: chrono::Duration::minutes(5),
            immediate_threshold: chrono::Duration::seconds(1),
            send_timeout: Duration::from_secs(5),
            terminal_retention: chrono::Duration::days(7),
            preferences_ttl: Duration::from_secs(60),
            immediate_capacity: 1000,
            policies: PolicyTable::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub key_path: String,
    pub key_id: String,
    pub team_id: String,
    pub topic: String,
    pub production: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    // None runs the pipeline against in-memory state
    pub database_url: Option<String>,
    pub apns: Option<ApnsConfig>,
    pub expo_push_url: String,
    pub expo_access_token: Option<String>,
    pub api_bind_address: String,
    pub api_auth_token: Option<String>,
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
    pub pipeline: PipelineConfig,
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .context(format!("{name} is not a valid value: {value}")),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // The APNs group is all-or-nothing once APNS_KEY_PATH is present
        let apns = match env::var("APNS_KEY_PATH") {
            Ok(key_path) => Some(ApnsConfig {
                key_path,
                key_id: env::var("APNS_KEY_ID").context("APNS_KEY_ID must be set")?,
                team_id: env::var("APNS_TEAM_ID").context("APNS_TEAM_ID must be set")?,
                topic: env::var("APNS_TOPIC").context("APNS_TOPIC must be set")?,
                production: env::var("APNS_PRODUCTION")
                    .map(|v| v == "true")
                    .unwrap_or(false),
            }),
            Err(_) => None,
        };

        let mut pipeline = PipelineConfig::default();
        if let Some(max_retries) = parse_var("MAX_RETRIES")? {
            pipeline.max_retries = max_retries;
        }
        if let Some(secs) = parse_var::<i64>("RETRY_BACKOFF_SECS")? {
            pipeline.retry_backoff = chrono::Duration::seconds(secs);
        }
        if let Some(secs) = parse_var("SEND_TIMEOUT_SECS")? {
            pipeline.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("PREFERENCES_TTL_SECS")? {
            // Preferences may be at most a minute stale
            pipeline.preferences_ttl = Duration::from_secs(secs.min(60));
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            apns,
            expo_push_url: env::var("EXPO_PUSH_URL").unwrap_or_else(|_| DEFAULT_EXPO_PUSH_URL.to_string()),
            expo_access_token: env::var("EXPO_ACCESS_TOKEN").ok(),
            api_bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            api_auth_token: env::var("API_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            tick_interval: Duration::from_secs(parse_var("TICK_INTERVAL_SECS")?.unwrap_or(60)),
            cleanup_interval: Duration::from_secs(parse_var("CLEANUP_INTERVAL_SECS")?.unwrap_or(3600)),
            pipeline,
        })
    }
}
