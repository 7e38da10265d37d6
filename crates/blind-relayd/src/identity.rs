//! Persistent relay identity
//!
//! The relay signs its handshake replies with an ed25519 key. The seed is
//! kept on disk so clients pinning the relay's public key keep working
//! across restarts.

use blind_relay_net::KeyPair;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// File name of the identity inside the storage directory
pub const IDENTITY_FILE: &str = "identity.bin";

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Our transport keypair seed
    pub keypair_seed: [u8; 32],
}

impl NodeState {
    fn generate() -> Self {
        let mut keypair_seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut keypair_seed);
        Self { keypair_seed }
    }

    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_seed(&self.keypair_seed)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> IdentityError + '_ {
    move |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Load the identity at `path`, creating it if missing
pub fn load_or_create(path: &Path) -> Result<NodeState, IdentityError> {
    match fs::read(path) {
        Ok(bytes) => {
            let state: NodeState = postcard::from_bytes(&bytes)?;
            info!("Loaded relay identity from {}", path.display());
            Ok(state)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let state = NodeState::generate();
            store(path, &state)?;
            info!("Created relay identity at {}", path.display());
            Ok(state)
        }
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Write `state` to `path`, replacing any previous identity
pub fn store(path: &Path, state: &NodeState) -> Result<(), IdentityError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
    }
    let bytes = postcard::to_allocvec(state)?;

    // Never leave a truncated identity behind
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))?;
    Ok(())
}

/// Resolve the relay keypair: persisted under `path`, or fresh if `None`
pub fn keypair(path: Option<&Path>) -> Result<KeyPair, IdentityError> {
    match path {
        Some(path) => Ok(load_or_create(path)?.keypair()),
        None => {
            info!("Using an ephemeral relay identity");
            Ok(KeyPair::generate())
        }
    }
}
