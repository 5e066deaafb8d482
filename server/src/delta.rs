//! Per-receiver delta encoding of world snapshots
//!
//! A snapshot broadcast is `[snapshot id:4 LE]` followed by one block per
//! player: the block marker, the player's slot, then `(tag, value)` pairs.
//! Against a known baseline only the fields whose value changed are written;
//! without one every tagged field is.
//!
//! When the next block would overflow a datagram a new fragment is started.
//! Every fragment repeats the snapshot id so each one is readable alone.

use crate::player::PlayerState;
use crate::snapshot::WorldSnapshot;
use arena_protocol::{ids, Packet, MAX_PAYLOAD};
use log::warn;

/// Starts a player block, followed by the slot id.
pub const PLAYER_BLOCK_MARKER: u8 = b'A';

/// Snapshot id at the start of every fragment.
const SNAPSHOT_HEADER_LEN: usize = 4;

/// Encoded value of a tagged field.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    F32(f32),
    U8(u8),
    Str(&'a str),
}

impl FieldValue<'_> {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            FieldValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            FieldValue::U8(v) => out.push(*v),
            FieldValue::Str(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
        }
    }
}

/// Bitwise comparison, so `-0.0` and `0.0` differ and NaN equals itself.
impl PartialEq for FieldValue<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::F32(a), FieldValue::F32(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::U8(a), FieldValue::U8(b)) => a == b,
            (FieldValue::Str(a), FieldValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

/// Network-visible player attributes, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerField {
    Name,
    Score,
    PositionX,
    PositionY,
    PositionZ,
    Pitch,
    Yaw,
    VelocityX,
    VelocityY,
    VelocityZ,
    AngularVelocityX,
    AngularVelocityY,
    Model,
    Weapon,
    LifeState,
}

impl PlayerField {
    pub const ALL: [PlayerField; 15] = [
        PlayerField::Name,
        PlayerField::Score,
        PlayerField::PositionX,
        PlayerField::PositionY,
        PlayerField::PositionZ,
        PlayerField::Pitch,
        PlayerField::Yaw,
        PlayerField::VelocityX,
        PlayerField::VelocityY,
        PlayerField::VelocityZ,
        PlayerField::AngularVelocityX,
        PlayerField::AngularVelocityY,
        PlayerField::Model,
        PlayerField::Weapon,
        PlayerField::LifeState,
    ];

    pub const fn tag(self) -> u8 {
        match self {
            PlayerField::Name => b'N',
            PlayerField::Score => b'L',
            PlayerField::PositionX => b'X',
            PlayerField::PositionY => b'Y',
            PlayerField::PositionZ => b'Z',
            PlayerField::Pitch => b'P',
            PlayerField::Yaw => b'Q',
            PlayerField::VelocityX => b'T',
            PlayerField::VelocityY => b'S',
            PlayerField::VelocityZ => b'R',
            PlayerField::AngularVelocityX => b'U',
            PlayerField::AngularVelocityY => b'V',
            PlayerField::Model => b'M',
            PlayerField::Weapon => b'W',
            PlayerField::LifeState => b'H',
        }
    }

    pub fn value(self, player: &PlayerState) -> FieldValue<'_> {
        let motion = &player.motion;
        match self {
            PlayerField::Name => FieldValue::Str(&player.name),
            PlayerField::Score => FieldValue::U8(player.score),
            PlayerField::PositionX => FieldValue::F32(motion.position.x),
            PlayerField::PositionY => FieldValue::F32(motion.position.y),
            PlayerField::PositionZ => FieldValue::F32(motion.position.z),
            PlayerField::Pitch => FieldValue::F32(motion.rotation.x),
            PlayerField::Yaw => FieldValue::F32(motion.rotation.y),
            PlayerField::VelocityX => FieldValue::F32(motion.velocity.x),
            PlayerField::VelocityY => FieldValue::F32(motion.velocity.y),
            PlayerField::VelocityZ => FieldValue::F32(motion.velocity.z),
            PlayerField::AngularVelocityX => FieldValue::F32(motion.angular_velocity.x),
            PlayerField::AngularVelocityY => FieldValue::F32(motion.angular_velocity.y),
            PlayerField::Model => FieldValue::U8(player.model),
            PlayerField::Weapon => FieldValue::U8(player.weapon),
            PlayerField::LifeState => FieldValue::U8(player.life.as_byte()),
        }
    }
}

/// Appends the tagged fields of `current` that differ from `baseline`, or
/// all of them when there is no baseline. Returns how many were written.
pub fn encode_player_fields(
    current: &PlayerState,
    baseline: Option<&PlayerState>,
    out: &mut Vec<u8>,
) -> usize {
    let mut written = 0;
    for field in PlayerField::ALL {
        let value = field.value(current);
        if let Some(previous) = baseline {
            if field.value(previous) == value {
                continue;
            }
        }
        out.push(field.tag());
        value.write(out);
        written += 1;
    }
    written
}

fn snapshot_fragment(snapshot_id: u32) -> Packet {
    let mut packet = Packet::udp(ids::SNAPSHOT);
    packet.add_u32_le(snapshot_id);
    packet
}

/// Builds the snapshot broadcast for the receiver identified by `receiver`.
///
/// `baseline` is the snapshot the receiver last acknowledged, if it is still
/// known. The receiver's own player is skipped, as are players with nothing
/// to report.
pub fn encode_snapshot(
    snapshot: &WorldSnapshot,
    receiver: &str,
    baseline: Option<&WorldSnapshot>,
) -> Vec<Packet> {
    let mut packets = vec![snapshot_fragment(snapshot.id)];
    let mut block = Vec::new();

    for player in snapshot.players.iter().filter(|p| p.account != receiver) {
        let previous = baseline.and_then(|b| b.player_by_account(&player.account));

        block.clear();
        block.push(PLAYER_BLOCK_MARKER);
        block.push(player.slot);
        if encode_player_fields(player, previous, &mut block) == 0 {
            continue;
        }

        if SNAPSHOT_HEADER_LEN + block.len() > MAX_PAYLOAD {
            warn!(
                "Block of slot {} is {} bytes and cannot fit in a datagram, skipped",
                player.slot,
                block.len()
            );
            continue;
        }

        let needs_new_fragment = packets
            .last()
            .is_some_and(|p| p.data.len() + block.len() > MAX_PAYLOAD);
        if needs_new_fragment {
            if packets.len() >= usize::from(u8::MAX) {
                warn!("Snapshot {} needs more than {} fragments, truncated", snapshot.id, u8::MAX);
                break;
            }
            packets.push(snapshot_fragment(snapshot.id));
        }
        if let Some(current) = packets.last_mut() {
            current.add_field(&block);
        }
    }

    let total = u8::try_from(packets.len()).unwrap_or(u8::MAX);
    for (index, packet) in packets.iter_mut().enumerate() {
        packet.index = u8::try_from(index).unwrap_or(u8::MAX);
        packet.total = total;
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{PlayerState, Vector3};
    use crate::snapshot::SnapshotHistory;
    use std::time::Instant;

    fn player(slot: u8, account: &str) -> PlayerState {
        PlayerState::new(slot, account, account, Vector3::default())
    }

    /// Splits a block body into its tags, assuming only f32/u8 fields.
    fn tags_of(body: &[u8]) -> Vec<u8> {
        let mut tags = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let tag = body[i];
            tags.push(tag);
            i += 1 + match tag {
                b'L' | b'M' | b'W' | b'H' => 1,
                b'N' => body[i + 1..].iter().position(|&b| b == 0).unwrap() + 1,
                _ => 4,
            };
        }
        tags
    }

    #[test]
    fn test_full_state_without_baseline() {
        let mut out = Vec::new();
        let written = encode_player_fields(&player(1, "p1"), None, &mut out);

        assert_eq!(written, PlayerField::ALL.len());
        let expected: Vec<u8> = PlayerField::ALL.iter().map(|f| f.tag()).collect();
        assert_eq!(tags_of(&out), expected);
    }

    #[test]
    fn test_only_changed_fields_against_baseline() {
        let before = player(1, "p1");
        let mut after = before.clone();
        after.motion.position.x = 1.0;

        let mut out = Vec::new();
        assert_eq!(encode_player_fields(&after, Some(&before), &mut out), 1);
        assert_eq!(out[0], b'X');
        assert_eq!(f32::from_le_bytes([out[1], out[2], out[3], out[4]]), 1.0);
    }

    #[test]
    fn test_tags_are_unique() {
        let mut tags: Vec<u8> = PlayerField::ALL.iter().map(|f| f.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), PlayerField::ALL.len());
    }

    #[test]
    fn test_snapshot_delta_against_acknowledged_baseline() {
        let mut history = SnapshotHistory::default();
        let now = Instant::now();
        let baseline = history.push(vec![player(0, "p1"), player(1, "p2")], vec![], now);

        let mut moved = player(0, "p1");
        moved.motion.position.x = 1.0;
        let current = history.push(vec![moved, player(1, "p2")], vec![], now);

        let packets = encode_snapshot(&current, "p2", Some(&baseline));
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), current.id);
        assert_eq!(&data[4..7], &[PLAYER_BLOCK_MARKER, 0, b'X']);
        assert_eq!(data.len(), 4 + 2 + 1 + 4);
    }

    #[test]
    fn test_snapshot_without_baseline_sends_everything_but_self() {
        let mut history = SnapshotHistory::default();
        let current = history.push(vec![player(0, "p1"), player(1, "p2")], vec![], Instant::now());

        let packets = encode_snapshot(&current, "p2", None);
        let data = &packets[0].data;
        assert_eq!(&data[4..6], &[PLAYER_BLOCK_MARKER, 0]);
        assert_eq!(tags_of(&data[6..]).len(), PlayerField::ALL.len());
    }

    #[test]
    fn test_identity_follows_account_not_slot() {
        let mut history = SnapshotHistory::default();
        let now = Instant::now();
        let baseline = history.push(vec![player(0, "old")], vec![], now);
        // slot 0 was recycled for a different account
        let current = history.push(vec![player(0, "new")], vec![], now);

        let packets = encode_snapshot(&current, "viewer", Some(&baseline));
        let tags = tags_of(&packets[0].data[6..]);
        assert_eq!(tags.len(), PlayerField::ALL.len());
    }

    #[test]
    fn test_unchanged_players_produce_no_block() {
        let mut history = SnapshotHistory::default();
        let now = Instant::now();
        let baseline = history.push(vec![player(0, "p1")], vec![], now);
        let current = history.push(vec![player(0, "p1")], vec![], now);

        let packets = encode_snapshot(&current, "viewer", Some(&baseline));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.len(), 4);
    }

    #[test]
    fn test_large_snapshots_split_on_block_boundaries() {
        let mut history = SnapshotHistory::default();
        let players: Vec<PlayerState> = (0..40u8)
            .map(|slot| player(slot, &format!("account-{}", slot)))
            .collect();
        let current = history.push(players, vec![], Instant::now());

        let packets = encode_snapshot(&current, "viewer", None);
        assert!(packets.len() > 1);
        for (index, packet) in packets.iter().enumerate() {
            assert_eq!(packet.index as usize, index);
            assert_eq!(packet.total as usize, packets.len());
            assert!(packet.data.len() <= MAX_PAYLOAD);
            assert_eq!(packet.get_u32_le(0).unwrap(), current.id);
            assert_eq!(packet.data[4], PLAYER_BLOCK_MARKER);
            assert_eq!(packet.encode().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_oversized_block_never_breaks_fragment_numbering() {
        let mut history = SnapshotHistory::default();
        let mut long = player(1, "long");
        long.name = "x".repeat(600);
        let current = history.push(
            vec![player(0, "p1"), long, player(2, "p3")],
            vec![],
            Instant::now(),
        );

        let packets = encode_snapshot(&current, "viewer", None);
        let mut datagrams = Vec::new();
        for packet in &packets {
            datagrams.extend(packet.encode().unwrap());
        }
        assert_eq!(datagrams.len(), packets.len());

        let decoded: Vec<Packet> = datagrams
            .iter()
            .map(|d| Packet::decode_single(d).unwrap())
            .collect();
        for (index, packet) in decoded.iter().enumerate() {
            assert_eq!(packet.index as usize, index);
            assert_eq!(packet.total as usize, decoded.len());
        }
        // no field value of these players contains the marker byte
        let slots: Vec<u8> = decoded
            .iter()
            .flat_map(|p| p.data[4..].windows(2))
            .filter(|w| w[0] == PLAYER_BLOCK_MARKER)
            .map(|w| w[1])
            .collect();
        assert!(slots.contains(&0));
        assert!(slots.contains(&2));
        assert!(!slots.contains(&1));
    }
}
