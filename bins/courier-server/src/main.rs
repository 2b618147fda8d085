use clap::Parser;

use courier_engine::{Broker, CourierConfig};

#[derive(Parser)]
#[command(name = "courier-server", about = "Courier message broker")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "courier.toml", env = "COURIER_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match CourierConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    tracing::info!(backend = ?config.storage.backend, "bootstrapping broker");
    let broker = match Broker::bootstrap(&config).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to bootstrap broker");
            std::process::exit(1);
        }
    };

    tracing::info!("courier-server started, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
    tracing::info!("shutting down...");

    if let Err(e) = broker.close().await {
        tracing::error!(error = %e, "broker close failed");
        std::process::exit(1);
    }
}
