//! Connection handshake
//!
//! The connecting peer opens with a `Hello` frame that declares the pairing
//! identifier it wants to be matched under. The relay answers with a
//! `Welcome` frame signed by its identity key, so a peer that knows the
//! relay's public key can tell it reached the right relay. After that the
//! connection carries opaque frames only.

use crate::crypto::{CryptoError, KeyPair};
use blind_relay_core::PairingId;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current handshake version
pub const PROTOCOL_VERSION: u8 = 1;

/// Domain separator for welcome signatures
const WELCOME_CONTEXT: &[u8] = b"blind-relay-welcome-v1:";

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid signature length: {0}")]
    InvalidSignatureLength(usize),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Unexpected relay key: {0}")]
    UnexpectedRelay(String),
}

/// First frame sent by a connecting peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    /// Identifier to be paired under
    pub pairing_id: PairingId,
    /// Fresh random value the relay signs back
    pub nonce: [u8; 32],
}

impl Hello {
    /// Create a hello with a random nonce
    pub fn new(pairing_id: PairingId) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            version: PROTOCOL_VERSION,
            pairing_id,
            nonce,
        }
    }

    pub fn to_frame(&self) -> Result<Bytes, HandshakeError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    /// Decode and check the version
    pub fn from_frame(frame: &[u8]) -> Result<Self, HandshakeError> {
        let hello: Self = postcard::from_bytes(frame)?;
        if hello.version != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion(hello.version));
        }
        Ok(hello)
    }

    fn signed_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(WELCOME_CONTEXT.len() + 64);
        message.extend_from_slice(WELCOME_CONTEXT);
        message.extend_from_slice(&self.nonce);
        message.extend_from_slice(self.pairing_id.as_bytes());
        message
    }
}

/// Relay's answer to a `Hello`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Relay public key
    pub relay_key: [u8; 32],
    /// Signature over the hello nonce and pairing identifier
    pub signature: Vec<u8>,
}

impl Welcome {
    /// Answer `hello` with a signature from `keypair`
    pub fn sign(keypair: &KeyPair, hello: &Hello) -> Self {
        Self {
            relay_key: keypair.public_key(),
            signature: keypair.sign(&hello.signed_message()).to_vec(),
        }
    }

    /// Check the signature, and the relay key if one is expected
    pub fn verify(&self, hello: &Hello, expected: Option<&[u8; 32]>) -> Result<(), HandshakeError> {
        if let Some(expected) = expected {
            if expected != &self.relay_key {
                return Err(HandshakeError::UnexpectedRelay(hex::encode(self.relay_key)));
            }
        }
        let signature: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::InvalidSignatureLength(self.signature.len()))?;
        KeyPair::verify(&self.relay_key, &hello.signed_message(), &signature)?;
        Ok(())
    }

    pub fn to_frame(&self) -> Result<Bytes, HandshakeError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, HandshakeError> {
        Ok(postcard::from_bytes(frame)?)
    }
}
