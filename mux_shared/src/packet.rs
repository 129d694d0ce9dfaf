//! Stack-structured packets.
//!
//! A `Packet` is an ordered stack of opaque byte frames. Each layer of the
//! stack pushes its own header on the way out and pops it on the way in.
//!
//! Wire encoding is the concatenation of `[u32 BE length][bytes]` frames,
//! outermost (most recently pushed) first.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PacketError;

/// Length prefix size of every frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Value-like stack of frames. The last element is the outermost frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    frames: Vec<Bytes>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new packet with `data` as its outermost frame.
    pub fn push_data(&self, data: impl Into<Bytes>) -> Packet {
        let mut frames = self.frames.clone();
        frames.push(data.into());
        Packet { frames }
    }

    /// Returns a new packet without the outermost frame.
    pub fn pop_data(&self) -> Result<Packet, PacketError> {
        let mut frames = self.frames.clone();
        frames.pop().ok_or(PacketError::Underflow)?;
        Ok(Packet { frames })
    }

    /// Reads the outermost frame.
    pub fn peek_data(&self) -> Result<&Bytes, PacketError> {
        self.frames.last().ok_or(PacketError::Underflow)
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frame bytes, excluding length prefixes.
    pub fn payload_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    /// Size of [`Packet::to_bytes`] output.
    pub fn encoded_len(&self) -> usize {
        self.payload_len() + FRAME_PREFIX_LEN * self.frames.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        for frame in self.frames.iter().rev() {
            buf.put_u32(frame.len() as u32);
            buf.extend_from_slice(frame);
        }
        buf.freeze()
    }

    /// Parses bytes produced by [`Packet::to_bytes`].
    ///
    /// Frames are sliced out of `data` without copying.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Packet, PacketError> {
        let mut data = data.into();
        let mut frames = Vec::new();
        while data.has_remaining() {
            if data.len() < FRAME_PREFIX_LEN {
                return Err(PacketError::Truncated {
                    needed: FRAME_PREFIX_LEN,
                    available: data.len(),
                });
            }
            let len = data.get_u32() as usize;
            if data.len() < len {
                return Err(PacketError::Truncated {
                    needed: len,
                    available: data.len(),
                });
            }
            frames.push(data.split_to(len));
        }
        // Wire order is outer-first; the stack keeps the outermost last.
        frames.reverse();
        Ok(Packet { frames })
    }
}
