//! blind-relayd - Blind rendezvous relay daemon
//!
//! This daemon provides:
//! - A TCP endpoint pairing peers by a shared identifier
//! - A persistent relay identity peers can pin
//! - Prometheus metrics and a health endpoint

pub mod config;
pub mod identity;
pub mod metrics;

pub use config::Config;
pub use identity::{IdentityError, NodeState};
pub use metrics::{MetricsError, MetricsServer};
