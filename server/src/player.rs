//! Simulated game objects: players and entities

use std::time::{Duration, Instant};

/// Network updates younger than this suppress dead reckoning.
pub const UPDATE_FRESHNESS: Duration = Duration::from_millis(15);
pub const MAX_HEALTH: u8 = 100;
/// Longest display name in bytes; keeps a full player block within one datagram.
pub const MAX_NAME_LEN: usize = 32;

/// Cuts `name` to at most [`MAX_NAME_LEN`] bytes on a character boundary.
pub fn clamp_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Vector in 3D space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn scale(&self, scalar: f32) -> Vector3 {
        Vector3 {
            x: self.x * scalar,
            y: self.y * scalar,
            z: self.z * scalar,
        }
    }

    pub fn add(&self, other: &Vector3) -> Vector3 {
        Vector3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

/// Position, orientation and their rates of change.
///
/// Rotation is pitch (`x`), yaw (`y`) and roll (`z`); players only use the
/// first two.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Motion {
    pub position: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
    pub angular_velocity: Vector3,
}

impl Motion {
    /// Advances position and rotation by their velocities over `dt` seconds.
    pub fn extrapolate(&mut self, dt: f32) {
        self.position = self.position.add(&self.velocity.scale(dt));
        self.rotation = self.rotation.add(&self.angular_velocity.scale(dt));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifeState {
    #[default]
    Alive,
    Dead,
}

impl LifeState {
    pub fn as_byte(self) -> u8 {
        match self {
            LifeState::Alive => 0,
            LifeState::Dead => 1,
        }
    }
}

/// Gameplay state of one authenticated player, owned by the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub slot: u8,
    /// Stable identity across snapshots; slots get recycled
    pub account: String,
    pub name: String,
    pub motion: Motion,
    pub score: u8,
    /// Kills since the last death
    pub streak: u8,
    /// Kills since joining
    pub victims: u32,
    pub weapon: u8,
    pub model: u8,
    pub health: u8,
    pub life: LifeState,
    pub died_at: Option<Instant>,
    /// When the client last reported its own transform
    pub last_network_update: Option<Instant>,
    /// Snapshot id of the receiver's delta baseline
    pub last_acknowledged: Option<u32>,
}

impl PlayerState {
    pub fn new(slot: u8, account: &str, name: &str, spawn: Vector3) -> Self {
        Self {
            slot,
            account: account.to_string(),
            name: clamp_name(name).to_string(),
            motion: Motion {
                position: spawn,
                ..Motion::default()
            },
            score: 0,
            streak: 0,
            victims: 0,
            weapon: 0,
            model: 0,
            health: MAX_HEALTH,
            life: LifeState::Alive,
            died_at: None,
            last_network_update: None,
            last_acknowledged: None,
        }
    }

    /// Whether dead reckoning should move this player at `now`.
    pub fn needs_extrapolation(&self, now: Instant) -> bool {
        match self.last_network_update {
            Some(at) => now.saturating_duration_since(at) >= UPDATE_FRESHNESS,
            None => true,
        }
    }

    pub fn kill(&mut self, now: Instant) {
        self.health = 0;
        self.life = LifeState::Dead;
        self.died_at = Some(now);
        self.streak = 0;
        self.motion.velocity = Vector3::default();
        self.motion.angular_velocity = Vector3::default();
    }

    pub fn respawn(&mut self, spawn: Vector3) {
        self.health = MAX_HEALTH;
        self.life = LifeState::Alive;
        self.died_at = None;
        self.motion = Motion {
            position: spawn,
            ..Motion::default()
        };
    }
}

/// Simulated object without a network identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: u32,
    pub model: u8,
    pub motion: Motion,
}

impl Entity {
    pub fn new(id: u32, model: u8, motion: Motion) -> Self {
        Self { id, model, motion }
    }
}
