use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::{is_truthy, parse_or};

/// Pool sizing plus the session settings every connection starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub disable_jit: bool,
    /// `None` keeps the server's statement_timeout.
    pub statement_timeout: Option<Duration>,
    pub application_name: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
            disable_jit: true,
            statement_timeout: None,
            application_name: "hookflow".to_string(),
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        let d = Self::default();

        let max_connections: u32 = parse_or(get("HOOKFLOW_DB_MAX_CONNECTIONS"), d.max_connections)?;
        let acquire_secs: u64 = parse_or(get("HOOKFLOW_DB_ACQUIRE_TIMEOUT_SECS"), d.acquire_timeout.as_secs())?;
        let statement_ms: u64 = parse_or(get("HOOKFLOW_DB_STATEMENT_TIMEOUT_MS"), 0)?;

        Ok(Self {
            max_connections: max_connections.clamp(1, 64),
            acquire_timeout: Duration::from_secs(acquire_secs.clamp(1, 60)),
            disable_jit: get("HOOKFLOW_DISABLE_JIT").map_or(d.disable_jit, |v| is_truthy(&v)),
            statement_timeout: (statement_ms > 0).then(|| Duration::from_millis(statement_ms)),
            application_name: get("HOOKFLOW_DB_APPLICATION_NAME").unwrap_or(d.application_name),
        })
    }

    fn session_statements(&self) -> Vec<String> {
        let mut stmts = Vec::new();
        if self.disable_jit {
            stmts.push("SET jit = OFF".to_string());
        }
        if let Some(timeout) = self.statement_timeout {
            stmts.push(format!("SET statement_timeout = {}", timeout.as_millis()));
        }
        stmts
    }
}

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let connect = PgConnectOptions::from_str(database_url)?.application_name(&settings.application_name);
    let stmts = Arc::new(settings.session_statements());

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            let stmts = stmts.clone();
            Box::pin(async move {
                for stmt in stmts.iter() {
                    sqlx::query(stmt).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(connect)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        statement_timeout_ms = settings.statement_timeout.map(|t| t.as_millis() as u64),
        "database pool ready"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
