use super::driver::{ChannelId, Driver, TransportError};
use crate::message::{Message, MessageError, MessageWriter};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One remote participant as seen by a session.
///
/// The wrapper does not own socket state. It names a driver channel and
/// serializes messages through the session's shared writer, which is cleared
/// after every send whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: u32,
    channel: ChannelId,
    address: String,
}

impl Connection {
    pub fn new(id: u32, channel: ChannelId, address: impl Into<String>) -> Self {
        Self {
            id,
            channel,
            address: address.into(),
        }
    }

    /// Session-local id used to address this participant in payloads.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_valid(&self, driver: &dyn Driver) -> bool {
        driver.is_connected(self.channel)
    }

    pub fn send_reliable<M: Message>(
        &self,
        driver: &mut dyn Driver,
        writer: &mut MessageWriter,
        message: &M,
    ) -> Result<(), SendError> {
        let result = match writer.write(message) {
            Ok(bytes) => driver.send_reliable(self.channel, bytes).map_err(SendError::from),
            Err(e) => Err(e.into()),
        };
        writer.clear();
        result
    }

    pub fn send_unreliable<M: Message>(
        &self,
        driver: &mut dyn Driver,
        writer: &mut MessageWriter,
        message: &M,
    ) -> Result<(), SendError> {
        let result = match writer.write(message) {
            Ok(bytes) => driver
                .send_unreliable(self.channel, bytes)
                .map_err(SendError::from),
            Err(e) => Err(e.into()),
        };
        writer.clear();
        result
    }
}
