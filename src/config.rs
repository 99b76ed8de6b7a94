//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `TURNSTILE_` (sections separated by
//! `__`, e.g. `TURNSTILE_RATE_LIMIT__LIMIT=50`).

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    OverrideLists, Quota, RegistryConfig, DEFAULT_MAX_IDLE, DEFAULT_SWEEP_INTERVAL,
};

/// Limit applied when the configured one is missing or not positive.
pub const DEFAULT_LIMIT: u32 = 100;
/// Window applied when the configured duration cannot be parsed.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Raw rate limiting settings, as written by the operator.
///
/// Nothing here is validated on load; [`RateLimitSettings::resolve`]
/// replaces bad values with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether admission control is active at all
    #[serde(default)]
    pub enabled: bool,

    /// Burst size and header limit; values below 1 fall back to 100
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Time to regain one token, e.g. `"1m"`, `"10s"`, `"1m30s"`
    #[serde(default = "default_window")]
    pub window: String,

    /// Comma-separated identities that bypass the limiter
    #[serde(default)]
    pub allow_list: String,

    /// Comma-separated identities that are always rejected
    #[serde(default)]
    pub deny_list: String,

    /// Idle seconds before a client limiter may be evicted
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_limit(),
            window: default_window(),
            allow_list: String::new(),
            deny_list: String::new(),
            max_idle_secs: default_max_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_limit() -> i64 {
    DEFAULT_LIMIT as i64
}

fn default_window() -> String {
    "1m".to_string()
}

fn default_max_idle_secs() -> u64 {
    DEFAULT_MAX_IDLE.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

/// Validated settings consumed by the admission layer.
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub enabled: bool,
    pub limit: NonZeroU32,
    pub window: Duration,
    pub overrides: OverrideLists,
    pub registry: RegistryConfig,
}

impl AdmissionSettings {
    /// Quota for new client limiters: `limit` burst, one token per window.
    pub fn quota(&self) -> Quota {
        Quota::per_window(self.limit, self.window)
    }

    /// Window length in whole seconds, as sent in `Retry-After`.
    ///
    /// Sub-second remainders round up so clients never retry too early.
    pub fn window_secs(&self) -> u64 {
        let secs = self.window.as_secs();
        if self.window.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl RateLimitSettings {
    /// Resolve raw settings into usable ones. Never fails.
    pub fn resolve(&self) -> AdmissionSettings {
        let limit = u32::try_from(self.limit)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or_else(|| {
                if self.enabled {
                    warn!(limit = self.limit, fallback = DEFAULT_LIMIT, "Invalid rate limit, using default");
                }
                NonZeroU32::new(DEFAULT_LIMIT).unwrap_or(NonZeroU32::MIN)
            });

        let window = match humantime::parse_duration(self.window.trim()) {
            Ok(window) if !window.is_zero() => window,
            _ => {
                if self.enabled {
                    warn!(
                        window = %self.window,
                        fallback = ?DEFAULT_WINDOW,
                        "Invalid rate limit window, using default"
                    );
                }
                DEFAULT_WINDOW
            }
        };

        AdmissionSettings {
            enabled: self.enabled,
            limit,
            window,
            overrides: OverrideLists::from_lists(&self.allow_list, &self.deny_list),
            registry: RegistryConfig {
                max_idle: Duration::from_secs(self.max_idle_secs.max(1)),
                sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            },
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("TURNSTILE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(TurnstileError::from)
    }

    /// Load configuration from a file path only.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(true))
            .build()?;
        config.try_deserialize().map_err(TurnstileError::from)
    }
}
