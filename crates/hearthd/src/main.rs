//! hearthd - Hearth community sync daemon
//!
//! Binds one device identity to one UDP endpoint: stores authored and
//! received events, exchanges Bloom summaries with configured peers and
//! serves solicited events back.

use clap::Parser;
use hearthd::config::Config;
use hearthd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("hearthd=info".parse().expect("static directive parses"));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("hearthd v{}", env!("CARGO_PKG_VERSION"));

    match Server::new(config) {
        Ok(server) => {
            if let Err(error) = server.run().await {
                error!("server error: {error:#}");
                return ExitCode::FAILURE;
            }
        }
        Err(error) => {
            error!("failed to initialize: {error:#}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
