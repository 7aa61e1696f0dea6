//! Data server front-end.
//!
//! Loads a TOML configuration and serves the streaming hub over TCP until
//! ctrl-c or a remote shutdown request.

use clap::Parser;
use lablink::data::server::DataServer;
use lablink::error::exit_code;
use lablink::Settings;
use std::path::PathBuf;
use tracing::{error, info};

/// Publishes and fans out instrument data streams.
#[derive(Parser)]
#[command(name = "dataserv", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    lablink::logging::init("lablink=info,dataserv=info");
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(exit_code::CONFIG);
        }
    };
    if let Some(listen) = cli.listen {
        settings.data_server.listen_addr = listen;
    }
    if let Err(e) = settings.validate() {
        error!(error = %e, "configuration rejected");
        std::process::exit(exit_code::CONFIG);
    }

    let server = match DataServer::start(&settings).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "data server failed to start");
            std::process::exit(e.exit_code());
        }
    };
    info!(
        addr = %server.local_addr(),
        instance = %server.instance_id(),
        "data server up"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = server.shutdown_requested() => info!("shutdown requested over the wire"),
    }
    server.stop().await;
}
