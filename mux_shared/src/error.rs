//! Error types for the packet codec and the Mux protocol layer.

use crate::entity::{EntityId, MsgKind, PairType};

/// Packet and stream framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Peek or pop on a packet with no frames.
    #[error("packet underflow: no frames to read")]
    Underflow,

    /// Input ended inside a length prefix or a frame body.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A stream message announced a length above the configured maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Mux protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// The outermost frame was not a 12-byte header.
    #[error("malformed mux header: {0} bytes")]
    MalformedHeader(usize),

    #[error("unknown message kind {0}")]
    UnknownMsgKind(i32),

    /// UPDATE/UNREGISTER named an entity id that is not mapped.
    #[error("{kind:?} for unknown entity {id:?}")]
    UnknownEntity { id: EntityId, kind: MsgKind },

    /// REGISTER named a pair type with no registered constructor.
    #[error("no constructor registered for {0:?}")]
    UnknownPairType(PairType),

    /// Strict mode: update on an entity nobody subscribes to.
    #[error("entity {0:?} has no subscribers")]
    NoSubscribers(EntityId),

    #[error("constructor for {pair_type:?} failed: {reason}")]
    Factory { pair_type: PairType, reason: String },
}

impl MuxError {
    /// Whether the error was caused by what a peer sent, as opposed to local misuse.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MuxError::Packet(_)
                | MuxError::MalformedHeader(_)
                | MuxError::UnknownMsgKind(_)
                | MuxError::UnknownEntity { .. }
                | MuxError::UnknownPairType(_)
                | MuxError::Factory { .. }
        )
    }
}

/// Errors decoding simulation payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("unknown avatar event {0}")]
    UnknownEvent(i32),

    #[error("unknown controllee {0:?}")]
    UnknownControllee(String),
}
