//! Authoritative world simulation
//!
//! [`World`] is owned by the tick task and is the only writer of gameplay
//! state. Network handlers describe what they want changed with a
//! [`GameCommand`]; the tick task applies every queued command before it
//! integrates, snapshots and diffs the world.

use crate::achievements::{self, Unlock};
use crate::address::UdpOutbound;
use crate::delta::encode_snapshot;
use crate::player::{Entity, LifeState, Motion, PlayerState, Vector3};
use crate::snapshot::SnapshotHistory;
use arena_protocol::{ids, Packet};
use log::{debug, info};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Time a dead player waits before respawning.
pub const RESPAWN_DELAY: Duration = Duration::from_secs(3);

/// State changes requested by network handlers.
#[derive(Debug, Clone)]
pub enum GameCommand {
    /// An authenticated player enters the world.
    Join {
        slot: u8,
        account: String,
        name: String,
        udp: Option<SocketAddr>,
    },
    Leave {
        slot: u8,
    },
    /// Client-authoritative transform update.
    Move {
        slot: u8,
        motion: Motion,
        received_at: Instant,
    },
    InfoChange {
        slot: u8,
        weapon: u8,
        model: u8,
    },
    Damage {
        attacker: u8,
        victim: u8,
        amount: u8,
    },
    /// The client received the given snapshot.
    Acknowledge {
        slot: u8,
        snapshot_id: u32,
    },
}

/// Side effects of applying a command, delivered by the tick task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    /// Packet for one player's control channel.
    Reply { slot: u8, packet: Packet },
    Achievement(Unlock),
}

pub struct World {
    players: BTreeMap<u8, PlayerState>,
    /// UDP endpoint of each player receiving snapshots
    endpoints: BTreeMap<u8, SocketAddr>,
    entities: Vec<Entity>,
    history: SnapshotHistory,
    spawn_points: Vec<Vector3>,
    tick_interval: Duration,
}

impl World {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            players: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            entities: Vec::new(),
            history: SnapshotHistory::default(),
            spawn_points: vec![Vector3::default()],
            tick_interval,
        }
    }

    /// Replaces the spawn points. An empty list spawns at the origin.
    pub fn with_spawn_points(mut self, spawn_points: Vec<Vector3>) -> Self {
        self.spawn_points = spawn_points;
        self
    }

    pub fn add_entity(&mut self, entity: Entity) {
        self.entities.push(entity);
    }

    pub fn player(&self, slot: u8) -> Option<&PlayerState> {
        self.players.get(&slot)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    fn spawn_point(&self) -> Vector3 {
        self.spawn_points
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or_default()
    }

    /// Applies one queued command.
    pub fn apply_command(&mut self, command: GameCommand, now: Instant) -> Vec<WorldEvent> {
        match command {
            GameCommand::Join {
                slot,
                account,
                name,
                udp,
            } => {
                let player = PlayerState::new(slot, &account, &name, self.spawn_point());
                info!("{} ({}) joined the world in slot {}", name, account, slot);
                self.players.insert(slot, player);
                match udp {
                    Some(addr) => self.endpoints.insert(slot, addr),
                    None => self.endpoints.remove(&slot),
                };
                vec![WorldEvent::Achievement(Unlock {
                    account,
                    id: achievements::FIRST_CONNECTION,
                })]
            }
            GameCommand::Leave { slot } => {
                self.endpoints.remove(&slot);
                if let Some(player) = self.players.remove(&slot) {
                    info!("{} left the world (slot {})", player.name, slot);
                }
                Vec::new()
            }
            GameCommand::Move {
                slot,
                motion,
                received_at,
            } => {
                match self.players.get_mut(&slot) {
                    Some(player) if player.life == LifeState::Alive => {
                        player.motion = motion;
                        player.last_network_update = Some(received_at);
                    }
                    Some(_) => debug!("Ignoring movement of dead player {}", slot),
                    None => debug!("Movement for unknown slot {}", slot),
                }
                Vec::new()
            }
            GameCommand::InfoChange {
                slot,
                weapon,
                model,
            } => {
                if let Some(player) = self.players.get_mut(&slot) {
                    player.weapon = weapon;
                    player.model = model;
                }
                Vec::new()
            }
            GameCommand::Damage {
                attacker,
                victim,
                amount,
            } => self.apply_damage(attacker, victim, amount, now),
            GameCommand::Acknowledge { slot, snapshot_id } => {
                self.acknowledge(slot, snapshot_id)
            }
        }
    }

    fn apply_damage(&mut self, attacker: u8, victim: u8, amount: u8, now: Instant) -> Vec<WorldEvent> {
        let Some(target) = self.players.get_mut(&victim) else {
            debug!("Damage for unknown slot {}", victim);
            return Vec::new();
        };
        if target.life == LifeState::Dead {
            return Vec::new();
        }

        target.health = target.health.saturating_sub(amount);
        if target.health > 0 {
            return Vec::new();
        }

        target.kill(now);
        let unlocks = if attacker == victim {
            info!("{} killed themselves", target.name);
            achievements::on_suicide(target)
        } else {
            let dead = target.clone();
            match self.players.get_mut(&attacker) {
                Some(killer) => {
                    info!("{} killed {}", killer.name, dead.name);
                    achievements::on_player_kill(killer, &dead)
                }
                None => Vec::new(),
            }
        };
        unlocks.into_iter().map(WorldEvent::Achievement).collect()
    }

    fn acknowledge(&mut self, slot: u8, snapshot_id: u32) -> Vec<WorldEvent> {
        let known = self.history.contains(snapshot_id);
        let Some(player) = self.players.get_mut(&slot) else {
            return Vec::new();
        };

        if known {
            player.last_acknowledged = Some(snapshot_id);
            return Vec::new();
        }

        debug!(
            "Player {}: {}",
            slot,
            crate::error::ServerError::StaleBaseline { snapshot_id }
        );
        player.last_acknowledged = None;
        let mut packet = Packet::tcp(ids::ACK);
        packet.add_field_bytes([0]);
        vec![WorldEvent::Reply { slot, packet }]
    }

    /// Advances players and entities by `dt` seconds of dead reckoning and
    /// respawns players whose respawn delay ran out.
    pub fn integrate(&mut self, now: Instant, dt: f32) {
        let spawn = self.spawn_point();
        for player in self.players.values_mut() {
            match (player.life, player.died_at) {
                (LifeState::Dead, Some(died_at))
                    if now.saturating_duration_since(died_at) >= RESPAWN_DELAY =>
                {
                    player.respawn(spawn);
                    debug!("{} respawned", player.name);
                }
                (LifeState::Dead, _) => {}
                (LifeState::Alive, _) => {
                    if player.needs_extrapolation(now) {
                        player.motion.extrapolate(dt);
                    }
                }
            }
        }
        for entity in &mut self.entities {
            entity.motion.extrapolate(dt);
        }
    }

    /// Runs one simulation step and returns the snapshot datagrams to send.
    pub fn tick(&mut self, now: Instant) -> Vec<UdpOutbound> {
        self.integrate(now, self.tick_interval.as_secs_f32());

        if self.history.prune(now) > 0 {
            let history = &self.history;
            for player in self.players.values_mut() {
                if player.last_acknowledged.is_some_and(|id| !history.contains(id)) {
                    player.last_acknowledged = None;
                }
            }
        }

        let snapshot = self.history.push(
            self.players.values().cloned().collect(),
            self.entities.clone(),
            now,
        );

        let mut outbound = Vec::new();
        for (slot, addr) in &self.endpoints {
            let Some(receiver) = self.players.get(slot) else {
                continue;
            };
            let baseline = receiver
                .last_acknowledged
                .and_then(|id| self.history.get(id));
            for packet in encode_snapshot(&snapshot, &receiver.account, baseline.as_deref()) {
                outbound.push(UdpOutbound {
                    addr: *addr,
                    packet,
                });
            }
        }
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::PLAYER_BLOCK_MARKER;
    use assert_approx_eq::assert_approx_eq;

    const TICK: Duration = Duration::from_millis(15);

    fn udp(port: u16) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn join(world: &mut World, slot: u8, account: &str, now: Instant) {
        world.apply_command(
            GameCommand::Join {
                slot,
                account: account.to_string(),
                name: account.to_string(),
                udp: udp(7000 + slot as u16),
            },
            now,
        );
    }

    fn datagrams_for(outbound: &[UdpOutbound], port: u16) -> Vec<&Packet> {
        outbound
            .iter()
            .filter(|o| o.addr.port() == port)
            .map(|o| &o.packet)
            .collect()
    }

    #[test]
    fn test_join_requests_first_connection_achievement() {
        let mut world = World::new(TICK);
        let events = world.apply_command(
            GameCommand::Join {
                slot: 0,
                account: "acc".to_string(),
                name: "Alice".to_string(),
                udp: None,
            },
            Instant::now(),
        );

        assert_eq!(
            events,
            vec![WorldEvent::Achievement(Unlock {
                account: "acc".to_string(),
                id: achievements::FIRST_CONNECTION,
            })]
        );
        assert_eq!(world.player_count(), 1);
    }

    #[test]
    fn test_moved_player_produces_single_field_delta() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);
        join(&mut world, 1, "p2", t);

        let first = world.tick(t);
        let baseline_id = datagrams_for(&first, 7001)[0].get_u32_le(0).unwrap();
        world.apply_command(
            GameCommand::Acknowledge {
                slot: 1,
                snapshot_id: baseline_id,
            },
            t,
        );

        let moved_at = t + TICK;
        world.apply_command(
            GameCommand::Move {
                slot: 0,
                motion: Motion {
                    position: Vector3::new(5.0, 0.0, 0.0),
                    ..Motion::default()
                },
                received_at: moved_at,
            },
            moved_at,
        );
        let second = world.tick(moved_at);

        let packets = datagrams_for(&second, 7001);
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        let mut expected = (baseline_id + 1).to_le_bytes().to_vec();
        expected.extend_from_slice(&[PLAYER_BLOCK_MARKER, 0, b'X']);
        expected.extend_from_slice(&5.0f32.to_le_bytes());
        assert_eq!(data, &expected);
    }

    #[test]
    fn test_stale_ack_replies_with_error_and_falls_back_to_full_state() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);
        join(&mut world, 1, "p2", t);

        let old = datagrams_for(&world.tick(t), 7001)[0].get_u32_le(0).unwrap();
        let later = t + Duration::from_secs(11);
        world.tick(later);
        assert!(!world.history().contains(old));

        let events = world.apply_command(
            GameCommand::Acknowledge {
                slot: 1,
                snapshot_id: old,
            },
            later,
        );
        match events.as_slice() {
            [WorldEvent::Reply { slot: 1, packet }] => {
                assert_eq!(packet.id, ids::ACK);
                assert_eq!(packet.data, vec![0]);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(world.player(1).unwrap().last_acknowledged, None);

        let next = world.tick(later + TICK);
        let data = &datagrams_for(&next, 7001)[0].data;
        // full state carries the name tag right after the block header
        assert_eq!(&data[4..7], &[PLAYER_BLOCK_MARKER, 0, b'N']);
    }

    #[test]
    fn test_pruning_clears_evicted_baselines() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);

        let id = datagrams_for(&world.tick(t), 7000)[0].get_u32_le(0).unwrap();
        world.apply_command(GameCommand::Acknowledge { slot: 0, snapshot_id: id }, t);
        assert_eq!(world.player(0).unwrap().last_acknowledged, Some(id));

        world.tick(t + Duration::from_secs(11));
        assert_eq!(world.player(0).unwrap().last_acknowledged, None);
    }

    #[test]
    fn test_dead_reckoning_respects_fresh_updates() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);
        let motion = Motion {
            velocity: Vector3::new(10.0, 0.0, 0.0),
            ..Motion::default()
        };
        world.apply_command(GameCommand::Move { slot: 0, motion, received_at: t }, t);

        world.integrate(t + Duration::from_millis(5), 0.015);
        assert_approx_eq!(world.player(0).unwrap().motion.position.x, 0.0, 1e-6);

        world.integrate(t + Duration::from_millis(20), 0.015);
        assert_approx_eq!(world.player(0).unwrap().motion.position.x, 0.15, 1e-6);
    }

    #[test]
    fn test_entities_are_always_extrapolated() {
        let mut world = World::new(TICK);
        world.add_entity(Entity::new(
            1,
            0,
            Motion {
                velocity: Vector3::new(0.0, -2.0, 0.0),
                ..Motion::default()
            },
        ));

        world.integrate(Instant::now(), 0.5);
        assert_approx_eq!(world.entities()[0].motion.position.y, -1.0, 1e-6);
    }

    #[test]
    fn test_lethal_damage_kills_and_respawns() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "killer", t);
        join(&mut world, 1, "victim", t);

        let events = world.apply_command(
            GameCommand::Damage { attacker: 0, victim: 1, amount: 60 },
            t,
        );
        assert!(events.is_empty());
        assert_eq!(world.player(1).unwrap().health, 40);

        let events = world.apply_command(
            GameCommand::Damage { attacker: 0, victim: 1, amount: 60 },
            t,
        );
        assert!(events.contains(&WorldEvent::Achievement(Unlock {
            account: "victim".to_string(),
            id: achievements::FIRST_DEATH,
        })));
        assert_eq!(world.player(1).unwrap().life, LifeState::Dead);
        assert_eq!(world.player(0).unwrap().score, 1);

        world.integrate(t + Duration::from_secs(1), 0.015);
        assert_eq!(world.player(1).unwrap().life, LifeState::Dead);
        world.integrate(t + RESPAWN_DELAY, 0.015);
        assert_eq!(world.player(1).unwrap().life, LifeState::Alive);
        assert_eq!(world.player(1).unwrap().health, crate::player::MAX_HEALTH);
    }

    #[test]
    fn test_leave_stops_snapshots() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);
        join(&mut world, 1, "p2", t);

        world.apply_command(GameCommand::Leave { slot: 0 }, t);
        let outbound = world.tick(t);

        assert!(datagrams_for(&outbound, 7000).is_empty());
        // p2 still gets a snapshot header even with nobody else around
        assert_eq!(datagrams_for(&outbound, 7001)[0].data.len(), 4);
    }

    #[test]
    fn test_info_change_is_diffed() {
        let mut world = World::new(TICK);
        let t = Instant::now();
        join(&mut world, 0, "p1", t);
        join(&mut world, 1, "p2", t);
        let id = datagrams_for(&world.tick(t), 7001)[0].get_u32_le(0).unwrap();
        world.apply_command(GameCommand::Acknowledge { slot: 1, snapshot_id: id }, t);

        world.apply_command(GameCommand::InfoChange { slot: 0, weapon: 3, model: 0 }, t);
        let outbound = world.tick(t + TICK);

        let data = &datagrams_for(&outbound, 7001)[0].data;
        assert_eq!(&data[4..], &[PLAYER_BLOCK_MARKER, 0, b'W', 3]);
    }
}
