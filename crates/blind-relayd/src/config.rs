//! Configuration for blind-relayd

use blind_relay_core::RelayConfig;
use blind_relay_net::TransportConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// blind-relayd - Blind rendezvous relay
#[derive(Parser, Debug, Clone)]
#[command(name = "blind-relayd")]
#[command(about = "Pairs peers by a shared identifier and forwards their frames")]
pub struct Config {
    /// Listen address for relay connections
    #[arg(short, long, env = "BLIND_RELAY_LISTEN", default_value = "0.0.0.0:49737")]
    pub listen: SocketAddr,

    /// Directory holding the relay identity
    #[arg(short, long, env = "BLIND_RELAY_STORAGE", default_value = "./data/blind-relay")]
    pub storage: PathBuf,

    /// Do not persist the identity; a new key is generated on every start
    #[arg(long, env = "BLIND_RELAY_USE_RAM")]
    pub ephemeral: bool,

    /// Host for the metrics server
    #[arg(long, env = "BLIND_RELAY_HTTP_HOST", default_value = "127.0.0.1")]
    pub http_host: String,

    /// Port for the metrics server (0 picks an ephemeral port)
    #[arg(long, env = "BLIND_RELAY_HTTP_PORT", default_value = "9464")]
    pub http_port: u16,

    /// Seconds a connection waits for its peer
    #[arg(long, env = "BLIND_RELAY_PAIRING_TIMEOUT", default_value = "10")]
    pub pairing_timeout_secs: u64,

    /// Seconds a new connection has to send its hello
    #[arg(long, env = "BLIND_RELAY_HANDSHAKE_TIMEOUT", default_value = "5")]
    pub handshake_timeout_secs: u64,

    /// Seconds of idle time before TCP keepalive kicks in (0 disables it)
    #[arg(long, env = "BLIND_RELAY_KEEPALIVE", default_value = "5")]
    pub keepalive_secs: u64,

    /// Maximum concurrent sessions (0 = unbounded)
    #[arg(long, env = "BLIND_RELAY_MAX_SESSIONS", default_value = "0")]
    pub max_sessions: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, env = "BLIND_RELAY_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pairing_timeout_secs == 0 {
            anyhow::bail!("Pairing timeout must be at least one second");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("Handshake timeout must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?} (expected json or pretty)", self.log_format);
        }
        if self.metrics_addr().is_err() {
            anyhow::bail!("Invalid metrics host {:?}", self.http_host);
        }
        Ok(())
    }

    /// Engine settings
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .with_pairing_timeout(Duration::from_secs(self.pairing_timeout_secs))
            .with_max_sessions(self.max_sessions)
    }

    /// Transport settings
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            keepalive: (self.keepalive_secs != 0).then(|| Duration::from_secs(self.keepalive_secs)),
            ..TransportConfig::default()
        }
    }

    /// Address the metrics server binds
    pub fn metrics_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.http_host, self.http_port).parse()?)
    }

    /// Path of the persisted identity
    pub fn identity_path(&self) -> Option<PathBuf> {
        (!self.ephemeral).then(|| self.storage.join(crate::identity::IDENTITY_FILE))
    }
}
