//! World snapshots and their bounded history
//!
//! Every tick the simulation freezes a deep copy of all players and entities
//! under a new snapshot id. Clients acknowledge the ids they receive, and the
//! acknowledged snapshot becomes the baseline for that client's next delta.
//! Only the last [`RETENTION`] worth of snapshots is kept.

use crate::player::{Entity, PlayerState};
use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a snapshot stays usable as a baseline.
pub const RETENTION: Duration = Duration::from_secs(10);

/// Immutable copy of the world at one tick.
#[derive(Debug, Clone)]
pub struct WorldSnapshot {
    pub id: u32,
    pub taken_at: Instant,
    pub players: Vec<PlayerState>,
    pub entities: Vec<Entity>,
}

impl WorldSnapshot {
    /// Finds a player by stable identity, never by slot.
    pub fn player_by_account(&self, account: &str) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.account == account)
    }
}

/// Snapshots ordered oldest first.
pub struct SnapshotHistory {
    snapshots: VecDeque<Arc<WorldSnapshot>>,
    retention: Duration,
    next_id: u32,
}

impl SnapshotHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            snapshots: VecDeque::new(),
            retention,
            next_id: 0,
        }
    }

    /// Stores a new snapshot under the next id (wrapping at 2^32).
    pub fn push(
        &mut self,
        players: Vec<PlayerState>,
        entities: Vec<Entity>,
        now: Instant,
    ) -> Arc<WorldSnapshot> {
        let snapshot = Arc::new(WorldSnapshot {
            id: self.next_id,
            taken_at: now,
            players,
            entities,
        });
        self.next_id = self.next_id.wrapping_add(1);
        self.snapshots.push_back(Arc::clone(&snapshot));
        snapshot
    }

    /// Evicts snapshots older than the retention window. Returns how many
    /// were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.snapshots.len();
        while let Some(oldest) = self.snapshots.front() {
            if now.saturating_duration_since(oldest.taken_at) <= self.retention {
                break;
            }
            self.snapshots.pop_front();
        }
        let evicted = before - self.snapshots.len();
        if evicted > 0 {
            debug!("Evicted {} snapshots from history", evicted);
        }
        evicted
    }

    pub fn get(&self, id: u32) -> Option<Arc<WorldSnapshot>> {
        self.snapshots.iter().rev().find(|s| s.id == id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.snapshots.iter().any(|s| s.id == id)
    }

    pub fn latest(&self) -> Option<&Arc<WorldSnapshot>> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new(RETENTION)
    }
}
