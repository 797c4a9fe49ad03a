//! Gateway client entry point
//!
//! Run with:
//! ```bash
//! DISCORD_TOKEN=... cargo run -p cordlink-gateway
//! ```
//!
//! Configuration is loaded from environment variables (and `.env`).

use cordlink_common::{try_init_tracing_with_config, AppConfig, TracingConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = try_init_tracing_with_config(&TracingConfig::for_environment(config.app.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    info!(
        app = %config.app.name,
        env = ?config.app.env,
        version = config.gateway.version,
        compress = config.gateway.compress,
        "Starting gateway client"
    );

    if let Err(e) = cordlink_gateway::run(config).await {
        error!(error = %format!("{e:#}"), "Gateway client stopped");
        std::process::exit(1);
    }
}
