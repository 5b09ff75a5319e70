//! Connect, handshake and travel state machines on top of a [`Driver`].
//!
//! [`Driver`]: crate::net::Driver

mod client;
mod messages;
mod server;

pub use client::{ClientEvent, ClientSession, ClientState};
pub use messages::{
    ClientConnect, ClientFinishedTravel, ClientInbound, ClientLevelStarted, ClientTravel,
    Disconnect, DisconnectReason, Heartbeat, ServerInbound, Welcome, client_registry,
    server_registry,
};
pub use server::{PeerState, ServerEvent, ServerSession};

use crate::message::RegistryError;
use crate::net::{ChannelId, SendError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("no session connection on channel {0}")]
    UnknownConnection(ChannelId),
    #[error("operation not valid while {0}")]
    InvalidState(&'static str),
}
