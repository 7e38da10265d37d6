//! blind-relayd - Blind rendezvous relay daemon
//!
//! Peers connect, declare a pairing identifier in their hello, and the
//! relay forwards frames between the two connections that declared the
//! same one. Payloads are never inspected.

use anyhow::Context;
use blind_relay_core::{Relay, RelayServer};
use blind_relay_net::{FramedStream, TcpRelayListener};
use blind_relayd::config::Config;
use blind_relayd::identity;
use blind_relayd::metrics::MetricsServer;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default = if config.verbose {
        "blind_relayd=debug,blind_relay_core=debug,blind_relay_net=debug"
    } else {
        "blind_relayd=info,blind_relay_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("Received shutdown signal");
}

async fn run(config: Config) -> anyhow::Result<()> {
    let keypair = identity::keypair(config.identity_path().as_deref())
        .context("Failed to load relay identity")?;

    let listener = TcpRelayListener::bind(config.listen, keypair, config.transport_config())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(
        "Relay server listening at public key {}",
        hex::encode(listener.public_key())
    );

    let relay: Relay<FramedStream> = Relay::new(config.relay_config());

    let addr = config.metrics_addr()?;
    let metrics = MetricsServer::start(addr, relay.clone())
        .await
        .with_context(|| format!("Failed to start metrics server on {}", addr))?;

    let server = RelayServer::start(listener, relay);

    shutdown_signal().await;

    server.close().await;
    metrics.close().await;

    let stats = server.relay().stats();
    info!(
        "Final stats: {} sessions paired, {} timed out, {} abandoned, {} bytes relayed",
        stats.sessions_paired, stats.pairing_timeouts, stats.abandoned_waits, stats.bytes_forwarded
    );
    info!("Blind relay shut down");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    init_logging(&config);

    info!(
        "blind-relayd v{} - Blind Rendezvous Relay",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = run(config).await {
        error!("Relay error: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
