use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use super::MessageError;

pub fn encode_rkyv<T>(value: &T, out: &mut Vec<u8>) -> Result<(), MessageError>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
{
    let bytes = rkyv::to_bytes::<rancor::Error>(value).map_err(MessageError::Encode)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

// Bodies arrive at arbitrary offsets inside receive buffers, so they are
// copied into an aligned buffer before validation.
pub fn decode_rkyv<T>(body: &[u8]) -> Result<T, MessageError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
        + Deserialize<T, HighDeserializer<rancor::Error>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(body.len());
    aligned.extend_from_slice(body);
    rkyv::from_bytes::<T, rancor::Error>(&aligned).map_err(MessageError::Decode)
}
