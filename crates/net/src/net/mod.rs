pub mod builtin;
pub mod connection;
pub mod driver;
pub mod framing;
pub mod hybrid;
pub mod loopback;
pub mod metrics;
pub mod platform;

pub use builtin::BuiltinDriver;
pub use connection::{Connection, SendError};
pub use driver::{
    ChannelId, ConnectionInfo, Delivery, Driver, DriverEvent, DriverKind, TransportError,
    create_colocated, create_driver,
};
pub use framing::{ControlFrame, FrameTooLarge, PendingReceive, ReadOutcome, StreamSource};
pub use hybrid::HybridDriver;
pub use loopback::LoopbackDriver;
pub use metrics::{ChannelMetrics, IoMetrics};
pub use platform::{
    NativeId, NetworkPlatform, PacketLossSimulation, PlatformChannel, PlatformError,
    PlatformEvent, SimEndpoint, SimPlatform,
};
