//! Wire framing shared by the stream-based drivers.
//!
//! Control frames correlate a datagram flow with an accepted stream; reliable
//! frames are a little-endian `u16` length followed by the payload.

use std::io::{self, Read};
use std::net::TcpStream;

use super::driver::ChannelId;

pub const SET_CHANNEL_ID: u8 = 0;
pub const ACK_CHANNEL_ID: u8 = 1;
pub const SET_CHANNEL_ID_LEN: usize = 3;
pub const ACK_CHANNEL_ID_LEN: usize = 1;
/// Datagrams up to this size are reserved for control traffic until the
/// handshake completes.
pub const CONTROL_FRAME_MAX: usize = 3;

pub const LENGTH_PREFIX_SIZE: usize = 2;
pub const MAX_RELIABLE_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    SetChannelId(ChannelId),
    AckChannelId,
}

impl ControlFrame {
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [SET_CHANNEL_ID, low, high] => Some(Self::SetChannelId(ChannelId(u16::from_le_bytes([
                *low, *high,
            ])))),
            [ACK_CHANNEL_ID] => Some(Self::AckChannelId),
            _ => None,
        }
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        match self {
            Self::SetChannelId(channel) => {
                out.push(SET_CHANNEL_ID);
                out.extend_from_slice(&channel.0.to_le_bytes());
            }
            Self::AckChannelId => out.push(ACK_CHANNEL_ID),
        }
    }

    pub fn to_vec(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SET_CHANNEL_ID_LEN);
        self.encode(&mut out);
        out
    }
}

#[derive(Debug, thiserror::Error)]
#[error("payload of {len} bytes exceeds the reliable frame limit of {MAX_RELIABLE_PAYLOAD}")]
pub struct FrameTooLarge {
    pub len: usize,
}

/// Writes `payload` as a length-prefixed frame into `out`, replacing its contents.
pub fn encode_reliable(payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameTooLarge> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameTooLarge { len: payload.len() })?;
    out.clear();
    out.reserve(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Non-blocking byte source the receive state machine reads from.
pub trait StreamSource {
    /// Copies available bytes into `buf` without consuming them.
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl StreamSource for TcpStream {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// Not enough bytes yet; try again next tick.
    Pending,
    /// The peer closed or reset the stream.
    Closed,
    /// The declared length exceeds the receive buffer.
    Oversized(usize),
}

/// Reads exactly `len` bytes once all of them are available, never blocking.
pub fn read_exact_available<S: StreamSource>(source: &mut S, len: usize) -> io::Result<ReadOutcome> {
    let mut buf = vec![0u8; len];
    match source.peek(&mut buf) {
        Ok(0) => return Ok(ReadOutcome::Closed),
        Ok(n) if n < len => return Ok(ReadOutcome::Pending),
        Ok(_) => {}
        Err(e) if is_transient(&e) => return Ok(ReadOutcome::Pending),
        Err(e) => return Err(e),
    }
    read_peeked(source, &mut buf)?;
    Ok(ReadOutcome::Frame(buf))
}

fn read_peeked<S: StreamSource>(source: &mut S, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Per-connection receive state for length-prefixed frames.
///
/// Invariant: `received <= declared <= capacity`.
#[derive(Debug)]
pub struct PendingReceive {
    buffer: Box<[u8]>,
    declared: Option<usize>,
    received: usize,
}

impl PendingReceive {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.min(MAX_RELIABLE_PAYLOAD)].into_boxed_slice(),
            declared: None,
            received: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn declared(&self) -> Option<usize> {
        self.declared
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn reset(&mut self) {
        self.declared = None;
        self.received = 0;
    }

    /// Advances the state machine with whatever `source` has available.
    ///
    /// The length prefix is only consumed once both bytes are present; payload
    /// bytes accumulate across calls until the declared length is reached.
    pub fn poll<S: StreamSource>(&mut self, source: &mut S) -> io::Result<ReadOutcome> {
        let declared = match self.declared {
            Some(declared) => declared,
            None => {
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                match source.peek(&mut prefix) {
                    Ok(0) => return Ok(ReadOutcome::Closed),
                    Ok(n) if n < LENGTH_PREFIX_SIZE => return Ok(ReadOutcome::Pending),
                    Ok(_) => {}
                    Err(e) if is_transient(&e) => return Ok(ReadOutcome::Pending),
                    Err(e) => return Err(e),
                }
                read_peeked(source, &mut prefix)?;

                let declared = u16::from_le_bytes(prefix) as usize;
                if declared > self.capacity() {
                    return Ok(ReadOutcome::Oversized(declared));
                }
                self.declared = Some(declared);
                self.received = 0;
                declared
            }
        };

        while self.received < declared {
            match source.read(&mut self.buffer[self.received..declared]) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Pending);
                }
                Err(e) => return Err(e),
            }
        }

        let frame = self.buffer[..declared].to_vec();
        self.reset();
        Ok(ReadOutcome::Frame(frame))
    }
}
