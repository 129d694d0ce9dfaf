//! Stream framing for packets.
//!
//! Every message on a connection is:
//!
//! ```text
//! +-------------------+---------------------------+
//! | length (4 bytes)  |  Packet encoding          |
//! | u32 big-endian    |  (length bytes)           |
//! +-------------------+---------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    error::PacketError,
    packet::{Packet, FRAME_PREFIX_LEN},
};

/// Appends one length-prefixed message to `out`.
pub fn encode_message(packet: &Packet, out: &mut BytesMut) {
    let body = packet.to_bytes();
    out.reserve(FRAME_PREFIX_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
}

/// Takes one complete message off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the length prefix or
/// body is still incomplete.
pub fn decode_message(buf: &mut BytesMut, max_len: usize) -> Result<Option<Packet>, PacketError> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(PacketError::FrameTooLarge { len, max: max_len });
    }
    if buf.len() < FRAME_PREFIX_LEN + len {
        buf.reserve(FRAME_PREFIX_LEN + len - buf.len());
        return Ok(None);
    }
    buf.advance(FRAME_PREFIX_LEN);
    let body = buf.split_to(len).freeze();
    Packet::from_bytes(body).map(Some)
}
