#![forbid(unsafe_code)]

pub mod hash;
pub mod identity;
pub mod envelope;

#[cfg(test)]
mod proptests;

pub use envelope::{
    open, open_message_or_sentinel, seal_file, seal_message, CipherBlob, EnvelopeError, FileMeta,
    UNDECRYPTABLE_SENTINEL,
};
pub use hash::derive_agent_id;
pub use identity::{AgentKeypair, AgentPublicKey, IdentityError};
