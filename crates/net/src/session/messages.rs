use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{MessageRegistry, MessageType, RegistryError, Side, Sides};
use crate::{rkyv_message, unit_message};

/// First message a server sends on a new connection.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub server_name: String,
    pub message: String,
    pub connection_id: u32,
}

rkyv_message!(Welcome, "tether.session.Welcome", Sides::CLIENT);

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientConnect {
    pub version: String,
    pub identity: [u8; 16],
}

rkyv_message!(ClientConnect, "tether.session.ClientConnect", Sides::SERVER);

impl ClientConnect {
    pub fn new(version: impl Into<String>, identity: Uuid) -> Self {
        Self {
            version: version.into(),
            identity: identity.into_bytes(),
        }
    }

    pub fn identity(&self) -> Uuid {
        Uuid::from_bytes(self.identity)
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    User,
    Error,
    TimedOut,
    WrongVersion,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::User => "disconnected",
            DisconnectReason::Error => "error",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::WrongVersion => "wrong version",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub detail: String,
}

rkyv_message!(Disconnect, "tether.session.Disconnect", Sides::BOTH);

/// Tells a client to load `level`. Actors outside `keep_alive_ids` are dropped.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientTravel {
    pub level: String,
    pub keep_alive_ids: Vec<u32>,
}

rkyv_message!(ClientTravel, "tether.session.ClientTravel", Sides::CLIENT);

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientFinishedTravel {
    pub level: String,
}

rkyv_message!(
    ClientFinishedTravel,
    "tether.session.ClientFinishedTravel",
    Sides::SERVER
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLevelStarted;

unit_message!(
    ClientLevelStarted,
    "tether.session.ClientLevelStarted",
    Sides::SERVER
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat;

unit_message!(Heartbeat, "tether.session.Heartbeat", Sides::SERVER);

/// Session messages a server can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInbound {
    ClientConnect(ClientConnect),
    Disconnect(Disconnect),
    ClientFinishedTravel(ClientFinishedTravel),
    ClientLevelStarted(ClientLevelStarted),
    Heartbeat(Heartbeat),
}

/// Session messages a client can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInbound {
    Welcome(Welcome),
    Disconnect(Disconnect),
    ClientTravel(ClientTravel),
}

pub fn server_registry() -> Result<MessageRegistry<ServerInbound>, RegistryError> {
    MessageRegistry::build(
        Side::Server,
        vec![
            MessageType::of(ServerInbound::ClientConnect),
            MessageType::of(ServerInbound::Disconnect),
            MessageType::of(ServerInbound::ClientFinishedTravel),
            MessageType::of(ServerInbound::ClientLevelStarted),
            MessageType::of(ServerInbound::Heartbeat),
        ],
    )
}

pub fn client_registry() -> Result<MessageRegistry<ClientInbound>, RegistryError> {
    MessageRegistry::build(
        Side::Client,
        vec![
            MessageType::of(ClientInbound::Welcome),
            MessageType::of(ClientInbound::Disconnect),
            MessageType::of(ClientInbound::ClientTravel),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageWriter};

    #[test]
    fn test_registries_split_by_side() {
        let server = server_registry().unwrap();
        let client = client_registry().unwrap();

        assert_eq!(server.len(), 5);
        assert_eq!(client.len(), 3);
        assert!(server.contains::<ClientConnect>());
        assert!(!server.contains::<Welcome>());
        assert!(client.contains::<Disconnect>());
        assert!(server.contains::<Disconnect>());
    }

    #[test]
    fn test_travel_decodes_through_client_registry() {
        let registry = client_registry().unwrap();
        let mut writer = MessageWriter::new();
        let travel = ClientTravel {
            level: "Level_Foo".to_string(),
            keep_alive_ids: vec![4, 8],
        };

        let frame = writer.write(&travel).unwrap().to_vec();
        assert_eq!(registry.decode(&frame).unwrap(), ClientInbound::ClientTravel(travel));
    }

    #[test]
    fn test_client_connect_carries_identity() {
        let identity = Uuid::new_v4();
        let connect = ClientConnect::new("v1.0", identity);
        let mut body = Vec::new();
        connect.encode_body(&mut body).unwrap();

        let decoded = ClientConnect::decode_body(&body).unwrap();
        assert_eq!(decoded.identity(), identity);
        assert_eq!(decoded.version, "v1.0");
    }

    #[test]
    fn test_unit_message_rejects_body() {
        assert!(Heartbeat::decode_body(&[]).is_ok());
        assert!(Heartbeat::decode_body(&[1]).is_err());
    }
}
