use std::time::Duration;

use anyhow::Context;

use crate::db::PoolSettings;
use crate::jobs::maintenance::Retention;
use crate::jobs::model::{DEFAULT_ATTEMPTS, DEFAULT_QUEUE};
use crate::jobs::retry::RetryConfig;
use crate::webhooks::platform::Platform;
use crate::webhooks::signature::{AuthMode, PlatformAuth, SignatureVerifier};

/// Runtime configuration, loaded once at startup from the environment.
///
/// Keys use the `HOOKFLOW_` prefix; most fall back to an unprefixed name so
/// existing deployments keep working.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db: PoolSettings,
    pub worker_id: String,
    pub queue: String,
    pub lease_timeout: Duration,
    pub http_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub maintenance_interval: Duration,
    pub default_attempts: i32,
    pub webhook_job_priority: i32,
    pub retry: RetryConfig,
    pub retention: Retention,
    pub log_json: bool,
    pub platforms: Vec<(Platform, PlatformAuth)>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. `from_env` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, fallback: &str| {
            lookup(primary)
                .filter(|s| !s.trim().is_empty())
                .or_else(|| lookup(fallback).filter(|s| !s.trim().is_empty()))
        };

        let database_url = get("HOOKFLOW_DATABASE_URL", "DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;
        let db = PoolSettings::from_lookup(&lookup)?;

        let worker_id = get("HOOKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let queue = get("HOOKFLOW_QUEUE", "QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let lease_seconds: u64 = parse_or(get("HOOKFLOW_LEASE_SECONDS", "LEASE_SECONDS"), 30)?;
        let http_addr = get("HOOKFLOW_HTTP_ADDR", "HTTP_ADDR")
            .map_or(Some("0.0.0.0:3000".to_string()), |s| normalize_optional_addr(&s));
        let migrate_on_startup = get("HOOKFLOW_MIGRATE_ON_STARTUP", "MIGRATE_ON_STARTUP")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let worker_concurrency: usize =
            parse_or(get("HOOKFLOW_WORKER_CONCURRENCY", "WORKER_CONCURRENCY"), 1)?;
        let poll_interval_ms: u64 = parse_or(get("HOOKFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS"), 250)?;
        let reap_interval_ms: u64 =
            parse_or(get("HOOKFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS"), 1_000)?;
        let maintenance_interval_secs: u64 = parse_or(
            get("HOOKFLOW_MAINTENANCE_INTERVAL_SECS", "MAINTENANCE_INTERVAL_SECS"),
            60,
        )?;

        let default_attempts: i32 =
            parse_or(get("HOOKFLOW_JOB_ATTEMPTS", "JOB_ATTEMPTS"), DEFAULT_ATTEMPTS)?;
        if default_attempts < 1 {
            anyhow::bail!("JOB_ATTEMPTS must be >= 1, got {default_attempts}");
        }
        let webhook_job_priority: i32 =
            parse_or(get("HOOKFLOW_WEBHOOK_JOB_PRIORITY", "WEBHOOK_JOB_PRIORITY"), 5)?;

        let defaults = RetryConfig::default();
        let backoff_base_ms: u64 = parse_or(
            get("HOOKFLOW_BACKOFF_BASE_MS", "BACKOFF_BASE_MS"),
            defaults.base_delay.as_millis() as u64,
        )?;
        let backoff_max_ms: u64 = parse_or(
            get("HOOKFLOW_BACKOFF_MAX_MS", "BACKOFF_MAX_MS"),
            defaults.max_delay.as_millis() as u64,
        )?;
        let retry = RetryConfig {
            base_delay: Duration::from_millis(backoff_base_ms),
            max_delay: Duration::from_millis(backoff_max_ms),
            jitter_pct: defaults.jitter_pct,
        };

        let retention_defaults = Retention::default();
        let retention = Retention {
            keep_completed: parse_or(
                get("HOOKFLOW_KEEP_COMPLETED", "KEEP_COMPLETED_JOBS"),
                retention_defaults.keep_completed,
            )?,
            keep_failed: parse_or(
                get("HOOKFLOW_KEEP_FAILED", "KEEP_FAILED_JOBS"),
                retention_defaults.keep_failed,
            )?,
        };

        let log_json = get("HOOKFLOW_LOG_JSON", "LOG_JSON")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let mut platforms = Vec::with_capacity(Platform::ALL.len());
        for platform in Platform::ALL {
            let prefix = platform.env_prefix();
            let mode = match lookup(&format!("{prefix}_WEBHOOK_AUTH")) {
                Some(raw) if !raw.trim().is_empty() => raw
                    .parse::<AuthMode>()
                    .with_context(|| format!("invalid {prefix}_WEBHOOK_AUTH"))?,
                _ => AuthMode::SharedSecret,
            };
            let secret = lookup(&format!("{prefix}_WEBHOOK_SECRET")).filter(|s| !s.is_empty());
            platforms.push((platform, PlatformAuth::new(mode, secret)));
        }

        Ok(Self {
            database_url,
            db,
            worker_id,
            queue,
            lease_timeout: Duration::from_secs(lease_seconds.max(1)),
            http_addr,
            migrate_on_startup,
            worker_concurrency: worker_concurrency.max(1),
            poll_interval: Duration::from_millis(poll_interval_ms),
            reap_interval: Duration::from_millis(reap_interval_ms),
            maintenance_interval: Duration::from_secs(maintenance_interval_secs),
            default_attempts,
            webhook_job_priority,
            retry,
            retention,
            log_json,
            platforms,
        })
    }

    pub fn signature_verifier(&self) -> SignatureVerifier {
        self.platforms
            .iter()
            .fold(SignatureVerifier::new(), |verifier, (platform, auth)| {
                verifier.with_platform(*platform, auth.clone())
            })
    }
}

pub(crate) fn parse_or<T>(value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value {raw:?}: {e}")),
        None => Ok(default),
    }
}

pub(crate) fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
