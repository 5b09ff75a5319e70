//! Property tests for the reliable framer and the message registry.
//!
//! Frames are fed to the receive state machine in arbitrary splits, one
//! chunk per tick, the way a non-blocking stream hands them over.

use std::collections::VecDeque;
use std::io;

use proptest::prelude::*;
use tether::message::{MessageRegistry, MessageType, Side, Sides};
use tether::net::framing::{MAX_RELIABLE_PAYLOAD, encode_reliable};
use tether::net::{PendingReceive, ReadOutcome, StreamSource};
use tether::{Message, MessageError};

struct SplitStream {
    chunks: VecDeque<Vec<u8>>,
    available: VecDeque<u8>,
}

impl SplitStream {
    fn new(bytes: &[u8], cuts: &[usize]) -> Self {
        let mut points: Vec<usize> = cuts.iter().map(|cut| cut % (bytes.len() + 1)).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();
        points.dedup();

        let chunks = points
            .windows(2)
            .map(|window| bytes[window[0]..window[1]].to_vec())
            .collect();
        Self {
            chunks,
            available: VecDeque::new(),
        }
    }

    /// Releases the next chunk. Returns `false` once everything was released.
    fn advance(&mut self) -> bool {
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.available.extend(chunk);
                true
            }
            None => false,
        }
    }
}

impl StreamSource for SplitStream {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.available.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.available.len());
        for (slot, byte) in buf.iter_mut().zip(self.available.iter()) {
            *slot = *byte;
        }
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.available.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.available.len());
        for (slot, byte) in buf.iter_mut().zip(self.available.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn receive_all(stream: &mut SplitStream, receiver: &mut PendingReceive) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        loop {
            match receiver.poll(stream).unwrap() {
                ReadOutcome::Frame(frame) => frames.push(frame),
                ReadOutcome::Pending => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(receiver.received() <= receiver.declared().unwrap_or(0));
        assert!(receiver.declared().unwrap_or(0) <= receiver.capacity());
        if !stream.advance() {
            return frames;
        }
    }
}

proptest! {
    /// Property: frames survive arbitrary split delivery, in order
    #[test]
    fn frames_survive_split_delivery(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
    ) {
        let mut wire = Vec::new();
        let mut frame = Vec::new();
        for payload in &payloads {
            encode_reliable(payload, &mut frame).unwrap();
            wire.extend_from_slice(&frame);
        }

        let mut stream = SplitStream::new(&wire, &cuts);
        let mut receiver = PendingReceive::new(MAX_RELIABLE_PAYLOAD);
        let frames = receive_all(&mut stream, &mut receiver);

        prop_assert_eq!(frames, payloads);
        prop_assert_eq!(receiver.declared(), None);
    }

    /// Property: a maximum-size frame split at one point arrives intact
    #[test]
    fn max_frame_survives_one_split(cut in 0usize..=MAX_RELIABLE_PAYLOAD + 2, fill in any::<u8>()) {
        let payload = vec![fill; MAX_RELIABLE_PAYLOAD];
        let mut wire = Vec::new();
        encode_reliable(&payload, &mut wire).unwrap();

        let mut stream = SplitStream::new(&wire, &[cut]);
        let mut receiver = PendingReceive::new(MAX_RELIABLE_PAYLOAD);
        let frames = receive_all(&mut stream, &mut receiver);

        prop_assert_eq!(frames.len(), 1);
        prop_assert!(frames[0] == payload);
    }

    /// Property: arbitrary bytes never panic the registry decoder
    #[test]
    fn arbitrary_frames_dont_crash_registry(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let registry = tether::session::server_registry().unwrap();
        let _result = registry.decode(&bytes);
    }

    /// Property: distinct names register and resolve to themselves
    #[test]
    fn distinct_types_resolve_by_hash(count in 1usize..16) {
        let mut registry: MessageRegistry<usize> = MessageRegistry::new(Side::Server);
        let types: Vec<MessageType<usize>> = (0..count).map(indexed_type).collect();
        prop_assert_eq!(registry.register(types).unwrap(), count);

        for index in 0..count {
            let frame = tether::message::type_hash(INDEXED_NAMES[index]).to_le_bytes();
            prop_assert_eq!(registry.decode(&frame).unwrap(), index);
        }
    }
}

const INDEXED_NAMES: [&str; 16] = [
    "tests.T0", "tests.T1", "tests.T2", "tests.T3", "tests.T4", "tests.T5", "tests.T6",
    "tests.T7", "tests.T8", "tests.T9", "tests.T10", "tests.T11", "tests.T12", "tests.T13",
    "tests.T14", "tests.T15",
];

macro_rules! indexed {
    ($($ty:ident => $index:literal),* $(,)?) => {
        $(
            struct $ty;

            impl Message for $ty {
                const NAME: &'static str = INDEXED_NAMES[$index];
                const SIDES: Sides = Sides::SERVER;

                fn encode_body(&self, _out: &mut Vec<u8>) -> Result<(), MessageError> {
                    Ok(())
                }

                fn decode_body(_body: &[u8]) -> Result<Self, MessageError> {
                    Ok($ty)
                }
            }
        )*

        fn indexed_type(index: usize) -> MessageType<usize> {
            match index {
                $($index => MessageType::of::<$ty>(|_| $index),)*
                _ => unreachable!(),
            }
        }
    };
}

indexed! {
    T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5, T6 => 6, T7 => 7,
    T8 => 8, T9 => 9, T10 => 10, T11 => 11, T12 => 12, T13 => 13, T14 => 14, T15 => 15,
}
