//! Instrument server front-end.
//!
//! Loads a TOML configuration, opens the configured drivers, and serves them
//! over TCP until ctrl-c or a remote shutdown request. Tunnels declared in
//! the configuration are opened alongside so clients on this machine can
//! reach instrument servers on others.

use clap::Parser;
use lablink::driver::registry::DriverRegistry;
use lablink::error::exit_code;
use lablink::server::InstrumentServer;
use lablink::tunnel::{SshTransport, TunnelManager};
use lablink::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hosts instrument drivers behind a TCP endpoint.
#[derive(Parser)]
#[command(name = "inserv", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(short, long)]
    listen: Option<String>,

    /// List the driver kinds this build can instantiate, then exit.
    #[arg(long)]
    list_kinds: bool,
}

#[tokio::main]
async fn main() {
    lablink::logging::init("lablink=info,inserv=info");
    let cli = Cli::parse();

    let registry = DriverRegistry::new();
    if cli.list_kinds {
        for kind in registry.kinds() {
            println!("{kind}");
        }
        return;
    }

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(exit_code::CONFIG);
        }
    };
    if let Some(listen) = cli.listen {
        settings.server.listen_addr = listen;
    }
    if let Err(e) = settings.validate() {
        error!(error = %e, "configuration rejected");
        std::process::exit(exit_code::CONFIG);
    }

    let server = match InstrumentServer::start(&settings, &registry).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "instrument server failed to start");
            std::process::exit(e.exit_code());
        }
    };
    info!(
        addr = %server.local_addr(),
        instance = %server.instance_id(),
        "instrument server up"
    );
    let degraded = !server.failed_drivers().is_empty();
    if degraded {
        warn!(drivers = ?server.failed_drivers(), "serving without failed drivers");
    }

    let mut tunnels = TunnelManager::new();
    for spec in settings.tunnels.clone() {
        let host = spec.remote_host.clone();
        let local_port = spec.local_port;
        let tunnel = tunnels.open(spec, Arc::new(SshTransport)).await;
        let mut lost_rx = tunnel.subscribe_lost();
        info!(%host, local_port, "tunnel session opened");
        tokio::spawn(async move {
            if let Ok(host) = lost_rx.recv().await {
                error!(%host, "tunnel lost after exhausting reconnect attempts");
            }
        });
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = server.shutdown_requested() => info!("shutdown requested over the wire"),
    }

    tunnels.close_all().await;
    server.stop().await;
    if degraded {
        std::process::exit(exit_code::DRIVER_INIT);
    }
}
