use super::{Message, MessageError};

/// Reusable scratch buffer that serializes messages into envelopes.
///
/// Every `write` starts from an empty buffer, so a failed encode never leaks
/// partial bytes into the next message.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buffer: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write<M: Message>(&mut self, message: &M) -> Result<&[u8], MessageError> {
        self.buffer.clear();
        self.buffer.extend_from_slice(&M::type_hash().to_le_bytes());
        if let Err(e) = message.encode_body(&mut self.buffer) {
            self.buffer.clear();
            return Err(e);
        }
        Ok(&self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
