use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub call_retention: Duration,
    pub call_ring_timeout: Duration,
    pub participant_timeout: Duration,
}

impl Config {
    /// Reads the process environment, falling back to a `.env` file.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:silentsignal.db?mode=rwc".to_owned()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16)?,
            call_retention: Duration::from_secs(parse_or(&lookup, "CALL_RETENTION_SECS", 60)?),
            call_ring_timeout: Duration::from_secs(parse_or(&lookup, "CALL_RING_SECS", 45)?),
            participant_timeout: Duration::from_millis(parse_or(&lookup, "PARTICIPANT_TIMEOUT_MS", 2000)?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}={raw:?}")),
        None => Ok(default),
    }
}
