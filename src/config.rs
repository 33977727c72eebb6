//! Relay configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! `RelayConfig::from_env` reads the process environment (after `.env` has
//! been loaded by `main`). Parsing itself lives in `from_lookup`, which takes
//! a key lookup closure so tests never mutate the process environment.
//!
//! Numeric knobs fall back to their defaults on parse failure. Enum-like
//! knobs (`MUTATION_POLICY`, `STORE_BACKEND`) reject unknown values so a typo
//! never silently changes relay semantics.

use std::time::Duration;

use crate::services::session::MutationPolicy;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_STORE_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {var}")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Which Persistence Bridge adapter the relay talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// Process-local map. Snapshots vanish on restart.
    Memory,
    Postgres { database_url: String, max_connections: u32 },
    /// Remote document API (`POST /api/whiteboards/save`, `GET /api/whiteboards/{id}`).
    Http { base_url: String, timeout_secs: u64 },
}

impl StoreConfig {
    /// Backend name as spelled in `STORE_BACKEND`. Safe to log; carries no credentials.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
            Self::Http { .. } => "http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    /// How long an empty session is kept in memory before eviction.
    pub grace_period: Duration,
    /// Idle delay between the last `board:autosave` request and the save.
    pub autosave_debounce: Duration,
    /// Bounded outbound queue per connection.
    pub client_channel_capacity: usize,
    pub mutation_policy: MutationPolicy,
    /// Seed newly created sessions from the store when the joiner supplies no snapshot.
    pub hydrate_on_join: bool,
    pub store: StoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            autosave_debounce: Duration::from_millis(DEFAULT_AUTOSAVE_DEBOUNCE_MS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            mutation_policy: MutationPolicy::Permissive,
            hydrate_on_join: false,
            store: StoreConfig::Memory,
        }
    }
}

impl RelayConfig {
    /// Build typed relay config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `GRACE_PERIOD_MS`: default 3000
    /// - `AUTOSAVE_DEBOUNCE_MS`: default 2000
    /// - `CLIENT_CHANNEL_CAPACITY`: default 256
    /// - `MUTATION_POLICY`: `permissive` (default) or `host_only`
    /// - `HYDRATE_ON_JOIN`: `true`/`false` (default false)
    /// - `STORE_BACKEND`: `memory` (default), `postgres`, or `http`
    ///
    /// Required by backend:
    /// - `postgres`: `DATABASE_URL` (`DB_MAX_CONNECTIONS` optional, default 5)
    /// - `http`: `STORE_HTTP_BASE_URL` (`STORE_HTTP_TIMEOUT_SECS` optional, default 10)
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for unknown enum values or missing backend settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_or = |key: &str, default: u64| lookup(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

        let port = lookup("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let client_channel_capacity = lookup("CLIENT_CHANNEL_CAPACITY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|cap| *cap > 0)
            .unwrap_or(DEFAULT_CLIENT_CHANNEL_CAPACITY);

        Ok(Self {
            port,
            grace_period: Duration::from_millis(parse_or("GRACE_PERIOD_MS", DEFAULT_GRACE_PERIOD_MS)),
            autosave_debounce: Duration::from_millis(parse_or("AUTOSAVE_DEBOUNCE_MS", DEFAULT_AUTOSAVE_DEBOUNCE_MS)),
            client_channel_capacity,
            mutation_policy: parse_mutation_policy(lookup("MUTATION_POLICY").as_deref())?,
            hydrate_on_join: parse_bool("HYDRATE_ON_JOIN", lookup("HYDRATE_ON_JOIN").as_deref())?,
            store: parse_store(&lookup)?,
        })
    }
}

fn parse_mutation_policy(raw: Option<&str>) -> Result<MutationPolicy, ConfigError> {
    match raw.unwrap_or("permissive") {
        "permissive" => Ok(MutationPolicy::Permissive),
        "host_only" => Ok(MutationPolicy::HostOnly),
        other => Err(ConfigError::Invalid { var: "MUTATION_POLICY", value: other.to_owned() }),
    }
}

fn parse_bool(var: &'static str, raw: Option<&str>) -> Result<bool, ConfigError> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None | Some("" | "0" | "false" | "no") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid { var, value: other.to_owned() }),
    }
}

fn parse_store(lookup: &impl Fn(&str) -> Option<String>) -> Result<StoreConfig, ConfigError> {
    match lookup("STORE_BACKEND").as_deref().unwrap_or("memory") {
        "memory" => Ok(StoreConfig::Memory),
        "postgres" => {
            let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing { var: "DATABASE_URL" })?;
            let max_connections = lookup("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
            Ok(StoreConfig::Postgres { database_url, max_connections })
        }
        "http" => {
            let base_url = lookup("STORE_HTTP_BASE_URL")
                .ok_or(ConfigError::Missing { var: "STORE_HTTP_BASE_URL" })?
                .trim_end_matches('/')
                .to_string();
            let timeout_secs = lookup("STORE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_STORE_HTTP_TIMEOUT_SECS);
            Ok(StoreConfig::Http { base_url, timeout_secs })
        }
        other => Err(ConfigError::Invalid { var: "STORE_BACKEND", value: other.to_owned() }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
