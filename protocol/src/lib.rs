//! # Arena Wire Protocol
//!
//! Shared definitions for the arena game's dual-transport protocol: TCP for
//! reliable control messages, UDP for high-frequency world state.
//!
//! ## Datagram Layout
//!
//! ```text
//! [checksum:1][id:1][index:1][total:1][payload...]
//! ```
//!
//! The checksum is a bit-weighted parity over everything after it (see
//! [`checksum`]). Payloads longer than [`MAX_PAYLOAD`] are split into
//! fragments sharing one id; receivers reassemble them by `index`.
//!
//! ## Fields
//!
//! Payload fields are written back to back without length prefixes. Fixed
//! fields are read by `(offset, length)`; strings end at a zero byte.

pub mod error;
pub mod framing;
pub mod packet;

pub use error::ProtocolError;
pub use packet::{checksum, Packet, TransportKind, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD};

/// Version byte exchanged during the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Packet type ids.
pub mod ids {
    pub const HANDSHAKE: u8 = 0x00;
    pub const CONNECT: u8 = 0x01;
    pub const DISCONNECT: u8 = 0x02;
    pub const CHAT: u8 = 0x03;
    /// World snapshot broadcast outbound, acknowledgement inbound.
    pub const SNAPSHOT: u8 = 0x04;
    pub const ACK: u8 = SNAPSHOT;
    pub const MOVEMENT: u8 = 0x05;
    pub const INFO_CHANGE: u8 = 0x07;
    pub const DAMAGE: u8 = 0x0C;
}

/// Fixed payload sizes.
pub const MOVEMENT_PAYLOAD_LEN: usize = 40;
pub const INFO_CHANGE_PAYLOAD_LEN: usize = 4;
