//! Stream framing for the TCP control channel
//!
//! TCP has no datagram boundaries, so every encoded datagram written to the
//! control channel is preceded by its length as a little-endian `u16`.

use crate::packet::MAX_DATAGRAM;

pub const FRAME_PREFIX_LEN: usize = 2;

/// Prefixes `datagram` with its length.
pub fn frame(datagram: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_PREFIX_LEN + datagram.len());
    framed.extend_from_slice(&(datagram.len() as u16).to_le_bytes());
    framed.extend_from_slice(datagram);
    framed
}

/// Validates a length prefix read from the stream.
pub fn frame_len(prefix: [u8; FRAME_PREFIX_LEN]) -> Option<usize> {
    let len = u16::from_le_bytes(prefix) as usize;
    (len <= MAX_DATAGRAM).then_some(len)
}
