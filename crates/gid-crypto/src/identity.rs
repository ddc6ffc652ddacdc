//! Identity module for agent keypair management.
//!
//! An agent owns a single X25519 static keypair. The public half is what the
//! relay directory caches and what senders wrap message keys to; the agent
//! identifier is derived from it, so the same keypair always maps to the same
//! identifier.

use std::fmt;

use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::derive_agent_id;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid public key encoding")]
    InvalidPublicKey,
}

/// Canonical public key of an agent (32 raw X25519 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentPublicKey([u8; 32]);

impl AgentPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Parse the hex wire encoding.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    /// Hex wire encoding, as sent in `REGISTER` and `KEY_FOUND`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The agent identifier this key maps to.
    pub fn agent_id(&self) -> String {
        derive_agent_id(&self.0)
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl fmt::Debug for AgentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentPublicKey({})", self.to_hex())
    }
}

/// A process-local agent keypair.
///
/// Key material is zeroized when the keypair is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AgentKeypair {
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    secret: StaticSecret,
}

impl AgentKeypair {
    /// Generate a new random keypair using the OS random source.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild a keypair from its 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(*bytes),
        }
    }

    /// Secret bytes, for persisting the identity locally. Never transmitted.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> AgentPublicKey {
        AgentPublicKey(*X25519PublicKey::from(&self.secret).as_bytes())
    }

    /// Agent identifier derived from the public key.
    pub fn agent_id(&self) -> String {
        self.public_key().agent_id()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for AgentKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentKeypair")
            .field("agent_id", &self.agent_id())
            .finish_non_exhaustive()
    }
}
