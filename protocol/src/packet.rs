//! Logical packets and their datagram representation
//!
//! A [`Packet`] is an id plus an ordered run of field bytes. Fields carry no
//! length prefix: readers either know a field's `(offset, length)` or scan a
//! zero-terminated string forward from an offset.
//!
//! On the wire every datagram is `[checksum][id][index][total][payload...]`.
//! Payloads larger than [`MAX_PAYLOAD`] are split into several datagrams that
//! share the id and are numbered by `index` out of `total`.

use crate::error::ProtocolError;

/// Largest datagram the protocol ever emits.
pub const MAX_DATAGRAM: usize = 576;
/// Checksum, id, index and total.
pub const HEADER_LEN: usize = 4;
/// Largest payload carried by a single datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// Transport a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Reliable, ordered control channel.
    Tcp,
    /// Unreliable, high-frequency state channel.
    #[default]
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub index: u8,
    pub total: u8,
    pub kind: TransportKind,
    pub data: Vec<u8>,
}

/// Bit-weighted parity over `bytes`.
///
/// Every set bit adds 1 when it sits at an even bit position and 2 at an odd
/// one, summed modulo 256. A single flipped bit always moves the sum by 1 or 2.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &byte| {
        (0..8).fold(sum, |acc, bit| {
            if byte & (1 << bit) != 0 {
                acc.wrapping_add(bit % 2 + 1)
            } else {
                acc
            }
        })
    })
}

impl Packet {
    /// Creates an empty, unsplit packet.
    pub fn new(id: u8, kind: TransportKind) -> Self {
        Self {
            id,
            index: 0,
            total: 1,
            kind,
            data: Vec::new(),
        }
    }

    pub fn tcp(id: u8) -> Self {
        Self::new(id, TransportKind::Tcp)
    }

    pub fn udp(id: u8) -> Self {
        Self::new(id, TransportKind::Udp)
    }

    /// Appends raw bytes.
    pub fn add_field(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Byte-literal form of [`Packet::add_field`].
    pub fn add_field_bytes<const N: usize>(&mut self, bytes: [u8; N]) -> &mut Self {
        self.add_field(&bytes)
    }

    /// Appends the UTF-8 bytes of `s` followed by a zero terminator.
    pub fn add_field_string(&mut self, s: &str) -> &mut Self {
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self
    }

    pub fn add_u32_le(&mut self, value: u32) -> &mut Self {
        self.add_field(&value.to_le_bytes())
    }

    pub fn add_f32_le(&mut self, value: f32) -> &mut Self {
        self.add_field(&value.to_le_bytes())
    }

    /// Returns `length` bytes starting at `offset`.
    pub fn get_field(&self, offset: usize, length: usize) -> Result<&[u8], ProtocolError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.data.len())
            .ok_or(ProtocolError::FieldOutOfRange {
                offset,
                length,
                payload_len: self.data.len(),
            })?;
        Ok(&self.data[offset..end])
    }

    /// Reads the string starting at `offset` up to the next zero byte or the
    /// end of the payload.
    pub fn get_field_string(&self, offset: usize) -> Result<String, ProtocolError> {
        if offset > self.data.len() {
            return Err(ProtocolError::FieldOutOfRange {
                offset,
                length: 0,
                payload_len: self.data.len(),
            });
        }
        let end = self.data[offset..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.data.len(), |pos| offset + pos);
        std::str::from_utf8(&self.data[offset..end])
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { offset })
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8, ProtocolError> {
        Ok(self.get_field(offset, 1)?[0])
    }

    pub fn get_u32_le(&self, offset: usize) -> Result<u32, ProtocolError> {
        let bytes = self.get_field(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_f32_le(&self, offset: usize) -> Result<f32, ProtocolError> {
        let bytes = self.get_field(offset, 4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Whether this packet needs (or came from) more than one datagram.
    pub fn is_split(&self) -> bool {
        self.total > 1 || self.data.len() > MAX_PAYLOAD
    }

    /// Encodes the packet into one or more checksummed datagrams.
    ///
    /// A payload that fits in one datagram keeps the packet's own
    /// `index`/`total`, which lets callers pre-split a logical message.
    pub fn encode(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.data.len() <= MAX_PAYLOAD {
            return Ok(vec![encode_datagram(
                self.id,
                self.index,
                self.total.max(1),
                &self.data,
            )]);
        }

        let count = self.data.len().div_ceil(MAX_PAYLOAD);
        let total = u8::try_from(count).map_err(|_| ProtocolError::TooManyFragments {
            payload_len: self.data.len(),
        })?;

        Ok(self
            .data
            .chunks(MAX_PAYLOAD)
            .enumerate()
            .map(|(index, chunk)| encode_datagram(self.id, index as u8, total, chunk))
            .collect())
    }

    /// Decodes one datagram without any reassembly.
    pub fn decode_single(datagram: &[u8]) -> Result<Packet, ProtocolError> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed {
                len: datagram.len(),
                min: HEADER_LEN,
            });
        }

        let expected = datagram[0];
        let computed = checksum(&datagram[1..]);
        if expected != computed {
            return Err(ProtocolError::InvalidChecksum { expected, computed });
        }

        Ok(Packet {
            id: datagram[1],
            index: datagram[2],
            total: datagram[3].max(1),
            kind: TransportKind::default(),
            data: datagram[HEADER_LEN..].to_vec(),
        })
    }

    /// Rebuilds one logical packet from decoded fragments fed in any order.
    ///
    /// Fragments whose id differs from the first one are ignored.
    pub fn reassemble(mut fragments: Vec<Packet>) -> Result<Packet, ProtocolError> {
        let (id, total, kind) = match fragments.first() {
            Some(first) => (first.id, first.total.max(1), first.kind),
            None => {
                return Err(ProtocolError::MissingFragment {
                    id: 0,
                    index: 0,
                    total: 1,
                })
            }
        };

        fragments.retain(|f| f.id == id);
        fragments.sort_by_key(|f| f.index);
        fragments.dedup_by_key(|f| f.index);

        for expected in 0..total {
            if fragments.get(expected as usize).map(|f| f.index) != Some(expected) {
                return Err(ProtocolError::MissingFragment {
                    id,
                    index: expected,
                    total,
                });
            }
        }

        let mut data = Vec::with_capacity(fragments.iter().map(|f| f.data.len()).sum());
        for fragment in fragments.iter().take(total as usize) {
            data.extend_from_slice(&fragment.data);
        }

        Ok(Packet {
            id,
            index: 0,
            total: 1,
            kind,
            data,
        })
    }
}

fn encode_datagram(id: u8, index: u8, total: u8, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
    datagram.extend_from_slice(&[0, id, index, total]);
    datagram.extend_from_slice(payload);
    datagram[0] = checksum(&datagram[1..]);
    datagram
}
