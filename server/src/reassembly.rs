//! Fragment buffering for split packets
//!
//! Fragments are grouped by source address and packet id. A group is handed
//! to [`Packet::reassemble`] once it holds `total` distinct indices; groups
//! that stop growing are discarded after [`FRAGMENT_TIMEOUT`].
//!
//! A source may have at most [`MAX_GROUPS_PER_SOURCE`] packets in flight
//! and the buffer as a whole at most [`MAX_PENDING_GROUPS`]; fragments that
//! would open a group beyond either limit are dropped.

use crate::error::Result;
use arena_protocol::Packet;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_GROUPS_PER_SOURCE: usize = 4;
pub const MAX_PENDING_GROUPS: usize = 256;

struct PartialPacket {
    total: u8,
    first_seen: Instant,
    fragments: BTreeMap<u8, Packet>,
}

pub struct Reassembler {
    pending: HashMap<(SocketAddr, u8), PartialPacket>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Feeds one decoded datagram. Returns the logical packet once it is
    /// complete; unsplit packets pass straight through.
    pub fn push(&mut self, source: SocketAddr, fragment: Packet, now: Instant) -> Result<Option<Packet>> {
        if fragment.total <= 1 {
            return Ok(Some(fragment));
        }

        let key = (source, fragment.id);
        if !self.pending.contains_key(&key) && !self.has_room_for(source, now) {
            debug!(
                "Too many split packets pending, dropping fragment of {:#04x} from {}",
                fragment.id, source
            );
            return Ok(None);
        }

        let timeout = self.timeout;
        let entry = self.pending.entry(key).or_insert_with(|| PartialPacket {
            total: fragment.total,
            first_seen: now,
            fragments: BTreeMap::new(),
        });

        let expired = now.saturating_duration_since(entry.first_seen) > timeout;
        if expired || entry.total != fragment.total {
            debug!(
                "Restarting reassembly of packet {:#04x} from {}",
                fragment.id, source
            );
            entry.total = fragment.total;
            entry.first_seen = now;
            entry.fragments.clear();
        }

        entry.fragments.insert(fragment.index, fragment);
        if entry.fragments.len() < entry.total as usize {
            return Ok(None);
        }

        match self.pending.remove(&key) {
            Some(complete) => Ok(Some(Packet::reassemble(
                complete.fragments.into_values().collect(),
            )?)),
            None => Ok(None),
        }
    }

    /// Whether `source` may open another group, after dropping stale ones.
    fn has_room_for(&mut self, source: SocketAddr, now: Instant) -> bool {
        let fits = |pending: &HashMap<(SocketAddr, u8), PartialPacket>| {
            let from_source = pending.keys().filter(|(addr, _)| *addr == source).count();
            pending.len() < MAX_PENDING_GROUPS && from_source < MAX_GROUPS_PER_SOURCE
        };
        if fits(&self.pending) {
            return true;
        }
        self.expire(now);
        fits(&self.pending)
    }

    /// Drops partial packets older than the timeout.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.first_seen) <= timeout);
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(FRAGMENT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use arena_protocol::ProtocolError;

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn split(id: u8, len: usize) -> (Vec<u8>, Vec<Packet>) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut packet = Packet::udp(id);
        packet.add_field(&payload);
        let fragments = packet
            .encode()
            .unwrap()
            .iter()
            .map(|d| Packet::decode_single(d).unwrap())
            .collect();
        (payload, fragments)
    }

    #[test]
    fn test_single_datagram_passes_through() {
        let mut reassembler = Reassembler::default();
        let mut packet = Packet::udp(5);
        packet.add_field_bytes([1, 2, 3]);

        let out = reassembler.push(source(1), packet, Instant::now()).unwrap();
        assert_eq!(out.unwrap().data, vec![1, 2, 3]);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_out_of_order_fragments_are_buffered_until_complete() {
        let mut reassembler = Reassembler::default();
        let (payload, mut fragments) = split(3, 1500);
        fragments.reverse();
        let now = Instant::now();

        let last = fragments.pop().unwrap();
        for fragment in fragments {
            assert!(reassembler.push(source(1), fragment, now).unwrap().is_none());
        }
        assert_eq!(reassembler.pending(), 1);

        let packet = reassembler.push(source(1), last, now).unwrap().unwrap();
        assert_eq!(packet.data, payload);
        assert_eq!(packet.total, 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_sources_are_kept_apart() {
        let mut reassembler = Reassembler::default();
        let (_, a) = split(3, 1000);
        let (_, b) = split(3, 1000);
        let now = Instant::now();

        assert!(reassembler.push(source(1), a[0].clone(), now).unwrap().is_none());
        assert!(reassembler.push(source(2), b[1].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_duplicate_fragments_do_not_complete_a_packet() {
        let mut reassembler = Reassembler::default();
        let (_, fragments) = split(3, 1000);
        let now = Instant::now();

        assert!(reassembler.push(source(1), fragments[0].clone(), now).unwrap().is_none());
        assert!(reassembler.push(source(1), fragments[0].clone(), now).unwrap().is_none());
        assert!(reassembler.push(source(1), fragments[1].clone(), now).unwrap().is_some());
    }

    #[test]
    fn test_stale_partial_packets_are_discarded() {
        let mut reassembler = Reassembler::default();
        let (_, fragments) = split(3, 1000);
        let t = Instant::now();

        reassembler.push(source(1), fragments[0].clone(), t).unwrap();
        let late = t + FRAGMENT_TIMEOUT + Duration::from_millis(1);
        // the first half expired, so this starts a new group
        assert!(reassembler.push(source(1), fragments[1].clone(), late).unwrap().is_none());

        assert_eq!(reassembler.expire(late + FRAGMENT_TIMEOUT * 2), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_out_of_range_index_fails_reassembly() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut fragment = Packet::udp(9);
        fragment.total = 2;
        fragment.index = 0;
        reassembler.push(source(1), fragment.clone(), now).unwrap();
        fragment.index = 7;

        let result = reassembler.push(source(1), fragment, now);
        assert!(matches!(
            result,
            Err(ServerError::Protocol(ProtocolError::MissingFragment { .. }))
        ));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_pending_groups_per_source_are_capped() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        for id in 0..=u8::MAX {
            let (_, fragments) = split(id, 1000);
            reassembler.push(source(1), fragments[0].clone(), now).unwrap();
        }
        assert_eq!(reassembler.pending(), MAX_GROUPS_PER_SOURCE);

        // an open group still completes, and other sources get their own room
        let (payload, fragments) = split(0, 1000);
        let packet = reassembler.push(source(1), fragments[1].clone(), now).unwrap();
        assert_eq!(packet.unwrap().data, payload);
        assert!(reassembler.push(source(2), fragments[0].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.pending(), MAX_GROUPS_PER_SOURCE);

        let (_, fragments) = split(4, 1000);
        reassembler.push(source(1), fragments[0].clone(), now).unwrap();
        assert_eq!(reassembler.pending(), MAX_GROUPS_PER_SOURCE + 1);

        // stale groups make room again
        let later = now + FRAGMENT_TIMEOUT * 2;
        let (_, fragments) = split(200, 1000);
        reassembler.push(source(1), fragments[0].clone(), later).unwrap();
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn test_total_pending_groups_are_capped() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let (_, fragments) = split(1, 1000);
        for port in 0..(MAX_PENDING_GROUPS as u16 + 10) {
            reassembler.push(source(port), fragments[0].clone(), now).unwrap();
        }
        assert_eq!(reassembler.pending(), MAX_PENDING_GROUPS);
    }
}
