pub mod config;
pub mod message;
pub mod net;
pub mod session;

pub use config::{
    BUILD_ID, ClientConfig, ConfigError, DEFAULT_PORT, ServerConfig, TransportConfig, load_toml,
};
pub use message::{
    Message, MessageError, MessageRegistry, MessageType, MessageWriter, RegistryError, Side, Sides,
};
pub use net::{
    ChannelId, Connection, ConnectionInfo, Delivery, Driver, DriverEvent, DriverKind, IoMetrics,
    PacketLossSimulation, TransportError, create_colocated, create_driver,
};
pub use session::{
    ClientEvent, ClientSession, ClientState, DisconnectReason, ServerEvent, ServerSession,
    SessionError,
};
