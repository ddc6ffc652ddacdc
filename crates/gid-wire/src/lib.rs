//! Wire protocol for the G.I.D relay.
//!
//! Frames travel over a persistent byte stream as `u32 BE length || body`,
//! where the body is UTF-8 text of the form `[TAG]payload`.

#![forbid(unsafe_code)]

pub mod frame;
pub mod framing;
pub mod stream;

pub use frame::{
    AgentSummary, Frame, PresenceStatus, Tag, WireError, PRIMARY_SEPARATOR, RECIPIENT_SEPARATOR,
    SECONDARY_SEPARATOR,
};
pub use framing::{FramingError, LengthCodec, DEFAULT_MAX_FRAME_SIZE};
pub use stream::{FrameReader, FrameWriter};
