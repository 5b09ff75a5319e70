use std::collections::HashMap;
use std::fmt;

use super::{Message, MessageError, Side, Sides, split_envelope};

type DecodeFn<E> = Box<dyn Fn(&[u8]) -> Result<E, MessageError>>;

/// Registration entry for one message type, decoding into the dispatch enum `E`.
pub struct MessageType<E> {
    name: &'static str,
    hash: u32,
    sides: Sides,
    decode: DecodeFn<E>,
}

impl<E: 'static> MessageType<E> {
    pub fn of<M: Message>(wrap: fn(M) -> E) -> Self {
        Self {
            name: M::NAME,
            hash: M::type_hash(),
            sides: M::SIDES,
            decode: Box::new(move |body| M::decode_body(body).map(wrap)),
        }
    }
}

impl<E> MessageType<E> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn sides(&self) -> Sides {
        self.sides
    }

    pub fn decode(&self, body: &[u8]) -> Result<E, MessageError> {
        (self.decode)(body)
    }
}

impl<E> fmt::Debug for MessageType<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("sides", &self.sides)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("message types `{first}` and `{second}` share type hash {hash:#010x}")]
    HashCollision {
        hash: u32,
        first: &'static str,
        second: &'static str,
    },
}

/// Hash-indexed table of the message types one side can receive.
pub struct MessageRegistry<E> {
    side: Side,
    entries: HashMap<u32, MessageType<E>>,
}

impl<E> MessageRegistry<E> {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            entries: HashMap::new(),
        }
    }

    /// Builds a registry from a static list of candidate types.
    pub fn build(side: Side, types: Vec<MessageType<E>>) -> Result<Self, RegistryError> {
        let mut registry = Self::new(side);
        registry.register(types)?;
        Ok(registry)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Inserts every candidate usable on this registry's side.
    ///
    /// All candidates are checked before anything is inserted: a hash
    /// collision with an existing entry or between two candidates leaves the
    /// registry untouched. Returns the number of types inserted.
    pub fn register(&mut self, types: Vec<MessageType<E>>) -> Result<usize, RegistryError> {
        let wanted = self.side.sides();
        let mut staged: HashMap<u32, MessageType<E>> = HashMap::new();

        for candidate in types {
            if let Some(existing) = self.entries.get(&candidate.hash) {
                return Err(RegistryError::HashCollision {
                    hash: candidate.hash,
                    first: existing.name,
                    second: candidate.name,
                });
            }
            if let Some(existing) = staged.get(&candidate.hash) {
                return Err(RegistryError::HashCollision {
                    hash: candidate.hash,
                    first: existing.name,
                    second: candidate.name,
                });
            }
            if !candidate.sides.intersects(wanted) {
                log::trace!("skipping {} on {:?} registry", candidate.name, self.side);
                continue;
            }
            staged.insert(candidate.hash, candidate);
        }

        let inserted = staged.len();
        self.entries.extend(staged);
        Ok(inserted)
    }

    pub fn lookup(&self, hash: u32) -> Option<&MessageType<E>> {
        self.entries.get(&hash)
    }

    pub fn contains<M: Message>(&self) -> bool {
        self.entries.contains_key(&M::type_hash())
    }

    /// Decodes a full envelope (type hash followed by body).
    pub fn decode(&self, frame: &[u8]) -> Result<E, MessageError> {
        let (hash, body) = split_envelope(frame)?;
        let entry = self.lookup(hash).ok_or(MessageError::UnknownType(hash))?;
        entry.decode(body)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> fmt::Debug for MessageRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("side", &self.side)
            .field("types", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageWriter;

    #[derive(Debug, PartialEq)]
    enum Probe {
        Ping(Ping),
        Pong(Pong),
        Shout(Shout),
        Twin(TwinA),
        OtherTwin(TwinB),
    }

    #[derive(Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
    struct Ping {
        nonce: u32,
    }
    crate::rkyv_message!(Ping, "tether.test.Ping", Sides::SERVER);

    #[derive(Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
    struct Pong {
        nonce: u32,
    }
    crate::rkyv_message!(Pong, "tether.test.Pong", Sides::CLIENT);

    #[derive(Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
    struct Shout {
        text: String,
    }
    crate::rkyv_message!(Shout, "tether.test.Shout", Sides::BOTH);

    #[derive(Debug, PartialEq)]
    struct TwinA;
    crate::unit_message!(TwinA, "tether.test.TwinA", Sides::BOTH);

    // Hashes deliberately forced onto TwinA's.
    #[derive(Debug, PartialEq)]
    struct TwinB;

    impl Message for TwinB {
        const NAME: &'static str = "tether.test.TwinB";
        const SIDES: Sides = Sides::BOTH;

        fn type_hash() -> u32 {
            TwinA::type_hash()
        }

        fn encode_body(&self, _out: &mut Vec<u8>) -> Result<(), MessageError> {
            Ok(())
        }

        fn decode_body(_body: &[u8]) -> Result<Self, MessageError> {
            Ok(TwinB)
        }
    }

    fn server_types() -> Vec<MessageType<Probe>> {
        vec![
            MessageType::of(Probe::Ping),
            MessageType::of(Probe::Pong),
            MessageType::of(Probe::Shout),
        ]
    }

    #[test]
    fn test_registers_only_usable_types() {
        let registry = MessageRegistry::build(Side::Server, server_types()).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains::<Ping>());
        assert!(registry.contains::<Shout>());
        assert!(!registry.contains::<Pong>());
    }

    #[test]
    fn test_each_type_resolves_by_its_own_hash() {
        let registry = MessageRegistry::build(Side::Server, server_types()).unwrap();

        assert_eq!(registry.lookup(Ping::type_hash()).unwrap().name(), "tether.test.Ping");
        assert_eq!(registry.lookup(Shout::type_hash()).unwrap().name(), "tether.test.Shout");

        let mut writer = MessageWriter::new();
        let frame = writer.write(&Shout { text: "hello".into() }).unwrap().to_vec();
        assert_eq!(
            registry.decode(&frame).unwrap(),
            Probe::Shout(Shout { text: "hello".into() })
        );

        let frame = writer.write(&Ping { nonce: 42 }).unwrap().to_vec();
        assert_eq!(registry.decode(&frame).unwrap(), Probe::Ping(Ping { nonce: 42 }));
    }

    #[test]
    fn test_unknown_hash_is_an_error() {
        let registry = MessageRegistry::build(Side::Server, server_types()).unwrap();
        let mut writer = MessageWriter::new();
        let frame = writer.write(&Pong { nonce: 1 }).unwrap().to_vec();

        assert!(matches!(
            registry.decode(&frame),
            Err(MessageError::UnknownType(hash)) if hash == Pong::type_hash()
        ));
    }

    #[test]
    fn test_collision_registers_neither() {
        let mut registry = MessageRegistry::new(Side::Client);
        let err = registry
            .register(vec![
                MessageType::of(Probe::Pong),
                MessageType::of(Probe::Twin),
                MessageType::of(Probe::OtherTwin),
            ])
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::HashCollision {
                hash: TwinA::type_hash(),
                first: "tether.test.TwinA",
                second: "tether.test.TwinB",
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_collision_with_existing_entry_keeps_table() {
        let mut registry = MessageRegistry::new(Side::Client);
        registry.register(vec![MessageType::of(Probe::Twin)]).unwrap();

        let result = registry.register(vec![
            MessageType::of(Probe::Pong),
            MessageType::of(Probe::OtherTwin),
        ]);

        assert!(result.is_err());
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains::<Pong>());
    }

    #[test]
    fn test_garbled_body_is_an_error() {
        let registry = MessageRegistry::build(Side::Server, server_types()).unwrap();
        let mut frame = Shout::type_hash().to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xFF; 3]);

        assert!(matches!(registry.decode(&frame), Err(MessageError::Decode(_))));
    }
}
