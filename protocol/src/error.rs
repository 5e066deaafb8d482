use thiserror::Error;

/// Failures raised while decoding datagrams or reading packet fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram shorter than the fixed header.
    #[error("malformed datagram: {len} bytes is shorter than the {min}-byte header")]
    Malformed { len: usize, min: usize },

    /// Checksum byte disagrees with the datagram contents.
    #[error("invalid checksum: expected {expected:#04x}, computed {computed:#04x}")]
    InvalidChecksum { expected: u8, computed: u8 },

    /// A reader asked for bytes the payload doesn't contain.
    #[error("field out of range: offset {offset} + length {length} exceeds payload of {payload_len} bytes")]
    FieldOutOfRange {
        offset: usize,
        length: usize,
        payload_len: usize,
    },

    /// A multi-datagram packet is missing one of its fragments.
    #[error("packet {id:#04x} is missing fragment {index} of {total}")]
    MissingFragment { id: u8, index: u8, total: u8 },

    /// A string field isn't valid UTF-8.
    #[error("string field at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    /// Payload too large to be described by a one-byte fragment count.
    #[error("payload of {payload_len} bytes needs more than 255 fragments")]
    TooManyFragments { payload_len: usize },
}
