use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::builtin::BuiltinDriver;
use super::framing::FrameTooLarge;
use super::hybrid::HybridDriver;
use super::loopback::LoopbackDriver;
use super::metrics::IoMetrics;
use super::platform::{PlatformError, SimPlatform};
use crate::config::TransportConfig;

/// Listener-assigned identity of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// Notifications raised by a driver, drained by its owner after each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Connected(ChannelId),
    /// Raised exactly once for every connection that raised `Connected`.
    Disconnected(ChannelId),
    Message {
        channel: ChannelId,
        delivery: Delivery,
        payload: Vec<u8>,
    },
    InvalidMessage(ChannelId),
    ReliableSendWouldBlock(ChannelId),
    /// An outbound connect never reached the connected state.
    ConnectFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub channel: ChannelId,
    pub address: String,
    pub datagram_address: Option<String>,
    pub valid: bool,
    pub metrics: IoMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    FrameTooLarge(#[from] FrameTooLarge),
    #[error("datagram of {0} bytes exceeds the unreliable payload limit")]
    DatagramTooLarge(usize),
    #[error("connection {0} is not connected")]
    NotConnected(ChannelId),
    #[error("driver is already listening or connected")]
    AlreadyActive,
    #[error("driver is not active")]
    Inactive,
    #[error("reliable send to {0} would block")]
    WouldBlock(ChannelId),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("{0} driver cannot be created on its own")]
    NeedsPeer(DriverKind),
}

/// Transport behind a session: one listening host or one outbound client.
///
/// Every call except [`Driver::connect`] is non-blocking. Connection
/// lifecycle and inbound traffic are
/// reported through [`DriverEvent`]s rather than return values, so failures
/// detected while ticking never escape as errors.
pub trait Driver {
    fn kind(&self) -> DriverKind;

    fn listen(&mut self, port: u16, max_connections: usize) -> Result<(), TransportError>;

    /// Starts an outbound connection; success is reported later as
    /// [`DriverEvent::Connected`].
    ///
    /// Drivers that need a stream may block here while it is established, for
    /// at most [`TransportConfig::connect_timeout`]. Unreachable servers fail
    /// synchronously.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    fn tick_server(&mut self);

    fn tick_client(&mut self);

    fn send_reliable(&mut self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError>;

    fn send_unreliable(&mut self, channel: ChannelId, payload: &[u8])
        -> Result<(), TransportError>;

    /// Drops one connection, raising `Disconnected` if it was connected.
    fn disconnect(&mut self, channel: ChannelId);

    /// Drops every connection and releases the driver's sockets.
    fn dispose(&mut self);

    fn poll_event(&mut self) -> Option<DriverEvent>;

    fn connection_info(&self, channel: ChannelId) -> Option<ConnectionInfo>;

    fn connections(&self) -> Vec<ChannelId>;

    /// Traffic counted since the last [`Driver::take_metrics`].
    fn metrics(&self) -> IoMetrics;

    /// Returns the counters accumulated since the previous call and resets them.
    fn take_metrics(&mut self) -> IoMetrics;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_connected(&self, channel: ChannelId) -> bool {
        self.connection_info(channel).is_some_and(|info| info.valid)
    }
}

#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: VecDeque<DriverEvent>,
}

impl EventQueue {
    pub(crate) fn push(&mut self, event: DriverEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn pop(&mut self) -> Option<DriverEvent> {
        self.events.pop_front()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Hybrid,
    Builtin,
    Loopback,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::Hybrid => "hybrid",
            DriverKind::Builtin => "builtin",
            DriverKind::Loopback => "loopback",
        })
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(DriverKind::Hybrid),
            "builtin" => Ok(DriverKind::Builtin),
            "loopback" => Ok(DriverKind::Loopback),
            other => Err(format!("unknown driver `{}`", other)),
        }
    }
}

/// Creates a standalone driver for a separate host or client process.
pub fn create_driver(
    kind: DriverKind,
    config: &TransportConfig,
) -> Result<Box<dyn Driver>, TransportError> {
    match kind {
        DriverKind::Hybrid => Ok(Box::new(HybridDriver::new(config.clone()))),
        DriverKind::Builtin | DriverKind::Loopback => Err(TransportError::NeedsPeer(kind)),
    }
}

/// Creates a host driver and a client driver that can reach each other
/// inside one process.
pub fn create_colocated(
    kind: DriverKind,
    config: &TransportConfig,
) -> (Box<dyn Driver>, Box<dyn Driver>) {
    match kind {
        DriverKind::Hybrid => (
            Box::new(HybridDriver::new(config.clone())),
            Box::new(HybridDriver::new(config.clone())),
        ),
        DriverKind::Builtin => {
            let platform = SimPlatform::new(
                config.platform_queue_capacity,
                config.unreliable_simulation.clone(),
            );
            (
                Box::new(BuiltinDriver::new(platform.endpoint())),
                Box::new(BuiltinDriver::new(platform.endpoint())),
            )
        }
        DriverKind::Loopback => {
            let (host, client) = LoopbackDriver::pair(config.loopback_capacity);
            (Box::new(host), Box::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("Hybrid".parse::<DriverKind>().unwrap(), DriverKind::Hybrid);
        assert_eq!("loopback".parse::<DriverKind>().unwrap(), DriverKind::Loopback);
        assert!("carrier-pigeon".parse::<DriverKind>().is_err());
        assert_eq!(DriverKind::Builtin.to_string(), "builtin");
    }

    #[test]
    fn test_standalone_loopback_needs_peer() {
        let result = create_driver(DriverKind::Loopback, &TransportConfig::default());
        assert!(matches!(result, Err(TransportError::NeedsPeer(DriverKind::Loopback))));
    }
}
