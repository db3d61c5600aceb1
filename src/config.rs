//! Configuration management for CoronaWatch
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer defaults, a `coronawatch.toml` file, environment variables
//! and command-line arguments.

use crate::cli::Cli;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// The configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "coronawatch.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Configuration for the HTTP API server.
    pub server: ServerConfig,
    /// Configuration for the upstream metric APIs.
    pub upstream: UpstreamConfig,
    /// Configuration for callback delivery and probing.
    pub delivery: DeliveryConfig,
    /// Configuration for the polling loop.
    pub scheduler: SchedulerConfig,
    /// Configuration for the webhook store.
    pub store: StoreConfig,
    /// Configuration for the Prometheus exporter.
    pub metrics: MetricsConfig,
}

/// Configuration for the HTTP API server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,
}

/// Configuration for the upstream metric APIs.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Root of the confirmed-cases API.
    pub cases_api_url: String,
    /// Root of the stringency API.
    pub stringency_api_url: String,
    /// Root of the country lookup API.
    pub countries_api_url: String,
    /// Timeout for a single upstream request in milliseconds.
    pub request_timeout_ms: u64,
}

/// Configuration for callback delivery and probing.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Timeout for a callback POST in milliseconds.
    pub timeout_ms: u64,
    /// Timeout for the registration-time reachability probe in milliseconds.
    pub probe_timeout_ms: u64,
}

/// Configuration for the polling loop.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How long to wait before rescanning an empty or unavailable store.
    pub idle_interval_seconds: u64,
    /// Pause after a failed invocation before the next cycle. A failed
    /// webhook stays due, so this keeps a broken subscriber from being
    /// retried in a tight loop.
    pub failure_backoff_ms: u64,
}

/// Configuration for the webhook store.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct StoreConfig {
    /// JSON snapshot file. The store is memory-only when unset.
    pub path: Option<PathBuf>,
}

/// Configuration for the Prometheus exporter.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Config {
    /// Loads the application configuration.
    ///
    /// Sources are merged in increasing priority: built-in defaults, the TOML
    /// file, `CORONAWATCH_*` environment variables (nested keys separated by
    /// `__`), `PORT`, and finally the command-line arguments.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // e.g. CORONAWATCH_SCHEDULER__IDLE_INTERVAL_SECONDS=10
            .merge(Env::prefixed("CORONAWATCH_").split("__"))
            .extract()?;

        if let Ok(port) = std::env::var("PORT") {
            config.server.listen_address.set_port(port.parse()?);
        }

        Ok(Figment::from(Serialized::defaults(config))
            .merge(cli.clone())
            .extract()?)
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            delivery: DeliveryConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            cases_api_url: "https://covid-api.mmediagroup.fr/v1".to_string(),
            stringency_api_url: "https://covidtrackerapi.bsg.ox.ac.uk/api/v2".to_string(),
            countries_api_url: "https://restcountries.com/v2".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_seconds: 5,
            failure_backoff_ms: 1_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}
