//! Configuration management for the ticket counter.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use ticket_sync_runtime::propagation::{
    ChannelSet, DEFAULT_POLL_INTERVAL, DEFAULT_TAB_KEY, DEFAULT_TOPIC, FanoutConfig,
};

use crate::client::{DEFAULT_COMMAND_TIMEOUT, SessionOptions};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Authoritative store
    pub database: DatabaseConfig,
    /// Propagation and session settings
    pub sync: SyncConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL; the in-memory store is used when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Propagation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Poll period in milliseconds (default: 500)
    pub poll_interval_ms: u64,
    /// Channels listened on, e.g. `all`, `none` or `poll,broadcast`
    pub channels: ChannelSet,
    /// Channels this client announces its commits on
    pub announce: ChannelSet,
    /// Broadcast topic
    pub broadcast_topic: String,
    /// Device storage key for tab sync
    pub tab_key: String,
    /// Per-command timeout in milliseconds (default: 5000)
    pub command_timeout_ms: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `tracing` filter directive (default: info)
    pub log_level: String,
    /// Install the Prometheus recorder
    pub metrics_enabled: bool,
    /// Prometheus listen address
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Falls back to defaults if environment variables are not set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    ///
    /// Unparseable values fall back to their default.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            },
            sync: SyncConfig {
                poll_interval_ms: parsed(&lookup, "SYNC_POLL_INTERVAL_MS")
                    .filter(|ms| *ms > 0)
                    .unwrap_or_else(|| duration_ms(DEFAULT_POLL_INTERVAL)),
                channels: channel_set(&lookup, "SYNC_CHANNELS"),
                announce: channel_set(&lookup, "SYNC_ANNOUNCE"),
                broadcast_topic: lookup("SYNC_BROADCAST_TOPIC")
                    .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                tab_key: lookup("SYNC_TAB_KEY").unwrap_or_else(|| DEFAULT_TAB_KEY.to_string()),
                command_timeout_ms: parsed(&lookup, "SESSION_COMMAND_TIMEOUT_MS")
                    .filter(|ms| *ms > 0)
                    .unwrap_or_else(|| duration_ms(DEFAULT_COMMAND_TIMEOUT)),
            },
            observability: ObservabilityConfig {
                log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
                metrics_enabled: parsed(&lookup, "METRICS_ENABLED").unwrap_or(false),
                metrics_addr: parsed(&lookup, "METRICS_ADDR")
                    .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9090))),
            },
        }
    }

    /// Fanout settings derived from the sync section
    #[must_use]
    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            channels: self.sync.channels,
            announce: self.sync.announce,
            poll_interval: Duration::from_millis(self.sync.poll_interval_ms),
            topic: self.sync.broadcast_topic.clone(),
            tab_key: self.sync.tab_key.clone(),
        }
    }

    /// Session settings derived from the sync section
    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            command_timeout: Duration::from_millis(self.sync.command_timeout_ms),
        }
    }
}

/// A channel list, or every channel when unset or invalid.
fn channel_set<F>(lookup: &F, key: &str) -> ChannelSet
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|s| match s.parse() {
            Ok(channels) => Some(channels),
            Err(error) => {
                tracing::warn!(%error, value = %s, key, "Ignoring channel list");
                None
            },
        })
        .unwrap_or_default()
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
