//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged on top
//! of the configuration from `coronawatch.toml` and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Notifies registered webhooks when COVID-19 metrics change.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address the HTTP API listens on.
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// JSON file the webhook store is persisted to.
    #[arg(long, value_name = "FILE")]
    pub store_path: Option<PathBuf>,

    /// Logging level (e.g. "debug", "info").
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Timeout for callback deliveries in milliseconds.
    #[arg(long, value_name = "MS")]
    pub delivery_timeout_ms: Option<u64>,

    /// Expose Prometheus metrics.
    #[arg(long)]
    pub metrics: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(listen) = self.listen {
            dict.insert("server".into(), nested("listen_address", listen.to_string()));
        }

        if let Some(path) = &self.store_path {
            dict.insert(
                "store".into(),
                nested("path", path.to_string_lossy().into_owned()),
            );
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        if let Some(timeout) = self.delivery_timeout_ms {
            dict.insert("delivery".into(), nested("timeout_ms", timeout));
        }

        // Only an explicit flag turns metrics on; its absence keeps the file's value.
        if self.metrics {
            dict.insert("metrics".into(), nested("enabled", true));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}

fn nested(key: &str, value: impl Into<Value>) -> Value {
    let mut dict = Dict::new();
    dict.insert(key.into(), value.into());
    Value::from(dict)
}
