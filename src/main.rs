//! CoronaWatch - COVID-19 webhook notification service.

use anyhow::Result;
use clap::Parser;
use coronawatch::{app::App, cli::Cli, config::Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = Config::load(&cli).unwrap_or_else(|err| {
        tracing_subscriber::fmt().init();
        error!("Failed to load configuration: {:#}", err);
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("CoronaWatch starting up...");

    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Listen Address: {}", config.server.listen_address);
    info!("Cases API: {}", config.upstream.cases_api_url);
    info!("Stringency API: {}", config.upstream.stringency_api_url);
    info!("Countries API: {}", config.upstream.countries_api_url);
    info!("Upstream Timeout: {}ms", config.upstream.request_timeout_ms);
    info!("Delivery Timeout: {}ms", config.delivery.timeout_ms);
    info!("Probe Timeout: {}ms", config.delivery.probe_timeout_ms);
    info!(
        "Scheduler Idle Interval: {}s",
        config.scheduler.idle_interval_seconds
    );
    match &config.store.path {
        Some(path) => info!("Store Path: {}", path.display()),
        None => info!("Store Path: in-memory"),
    }
    info!(
        "Metrics: {}",
        if config.metrics.enabled {
            format!("enabled on {}", config.metrics.listen_address)
        } else {
            "disabled".to_string()
        }
    );
    info!("-------------------------------------------------------");

    let app = App::builder(config).build().await?;

    let task_manager = app.task_manager();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received."),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        task_manager.trigger_shutdown();
    });

    app.run().await?;
    info!("All tasks shut down. Exiting.");
    Ok(())
}
