//! Message identity, envelopes and the hash-indexed dispatch table.
//!
//! Every serialized message starts with a little-endian `u32` type hash
//! followed by the body. The receiving side reads the hash, looks the type up
//! in its [`MessageRegistry`] and decodes the body into its own dispatch enum,
//! so the transport never switches on concrete message types.

mod codec;
mod registry;
mod writer;

pub use codec::{decode_rkyv, encode_rkyv};
pub use registry::{MessageRegistry, MessageType, RegistryError};
pub use writer::MessageWriter;

use bitflags::bitflags;

/// Size of the type hash that prefixes every message.
pub const ENVELOPE_HEADER_SIZE: usize = 4;

bitflags! {
    /// Which side of a session may receive a message type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Sides: u8 {
        const SERVER = 1 << 0;
        const CLIENT = 1 << 1;
        const BOTH = Self::SERVER.bits() | Self::CLIENT.bits();
    }
}

/// The side a registry is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn sides(self) -> Sides {
        match self {
            Side::Server => Sides::SERVER,
            Side::Client => Sides::CLIENT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("frame of {0} bytes is too short for a message envelope")]
    ShortFrame(usize),
    #[error("no message type registered for hash {0:#010x}")]
    UnknownType(u32),
    #[error("encoding failed: {0}")]
    Encode(rkyv::rancor::Error),
    #[error("decoding failed: {0}")]
    Decode(rkyv::rancor::Error),
    #[error("unexpected body of {0} bytes for an empty message")]
    UnexpectedBody(usize),
}

/// Stable identity of a qualified message name.
pub fn type_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// A value that can travel inside a message envelope.
///
/// `NAME` is the fully qualified name hashed into the envelope; it must be
/// unique per process, which [`MessageRegistry::register`] enforces.
pub trait Message: Sized + 'static {
    const NAME: &'static str;
    const SIDES: Sides;

    fn type_hash() -> u32 {
        type_hash(Self::NAME)
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), MessageError>;

    fn decode_body(body: &[u8]) -> Result<Self, MessageError>;
}

/// Splits a frame into its type hash and body.
pub fn split_envelope(frame: &[u8]) -> Result<(u32, &[u8]), MessageError> {
    if frame.len() < ENVELOPE_HEADER_SIZE {
        return Err(MessageError::ShortFrame(frame.len()));
    }
    let (head, body) = frame.split_at(ENVELOPE_HEADER_SIZE);
    let hash = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    Ok((hash, body))
}

/// Implements [`Message`] for an rkyv-archivable type.
#[macro_export]
macro_rules! rkyv_message {
    ($ty:ty, $name:expr, $sides:expr) => {
        impl $crate::message::Message for $ty {
            const NAME: &'static str = $name;
            const SIDES: $crate::message::Sides = $sides;

            fn encode_body(
                &self,
                out: &mut Vec<u8>,
            ) -> Result<(), $crate::message::MessageError> {
                $crate::message::encode_rkyv(self, out)
            }

            fn decode_body(body: &[u8]) -> Result<Self, $crate::message::MessageError> {
                $crate::message::decode_rkyv(body)
            }
        }
    };
}

/// Implements [`Message`] for a unit struct with an empty body.
#[macro_export]
macro_rules! unit_message {
    ($ty:ident, $name:expr, $sides:expr) => {
        impl $crate::message::Message for $ty {
            const NAME: &'static str = $name;
            const SIDES: $crate::message::Sides = $sides;

            fn encode_body(
                &self,
                _out: &mut Vec<u8>,
            ) -> Result<(), $crate::message::MessageError> {
                Ok(())
            }

            fn decode_body(body: &[u8]) -> Result<Self, $crate::message::MessageError> {
                if body.is_empty() {
                    Ok($ty)
                } else {
                    Err($crate::message::MessageError::UnexpectedBody(body.len()))
                }
            }
        }
    };
}
