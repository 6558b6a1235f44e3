use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use manifold_api::metrics::AtomicMetrics;
use manifold_engine::config::EngineConfig;
use manifold_engine::coordinator::Coordinator;
use manifold_engine::logbus::LogBusLayer;

#[derive(Parser)]
#[command(name = "manifold-server", about = "Manifold log and event multiplexer", version)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(long, default_value = "config.yaml", env = "MANIFOLD_CONFIG")]
    config: String,

    /// Validate the configuration and exit without starting workers.
    #[arg(long)]
    check: bool,
}

fn register_plugins() {
    consumer_profiler::register();
    producer_console::register();
    producer_file::register();
    modulator_basic::register();
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(LogBusLayer)
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "manifold-server starting");
    register_plugins();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match EngineConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(AtomicMetrics::new());
    let mut coordinator = match Coordinator::configure(config, metrics.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to configure pipeline");
            std::process::exit(1);
        }
    };

    if cli.check {
        tracing::info!(
            producers = coordinator.producer_count(),
            consumers = coordinator.consumer_count(),
            "configuration ok"
        );
        return;
    }

    coordinator.start();
    tracing::info!("manifold-server started, send SIGINT/SIGTERM to stop, SIGHUP to roll");

    if let Err(e) = coordinator.run().await {
        tracing::error!(error = %e, "run loop failed");
    }

    coordinator.shutdown().await;

    for (name, value) in metrics.snapshot() {
        tracing::debug!(metric = %name, value, "final metric");
    }
}
