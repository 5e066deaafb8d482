//! Connected sessions and player slot allocation
//!
//! This module tracks the network side of every player:
//! - Slot allocation (lowest free id first, reused after disconnect)
//! - Address lookup for packets arriving over UDP
//! - Authentication state and identity once the connect handshake succeeds
//! - The per-connection TCP outbound queue
//!
//! Gameplay state lives in the simulation's [`World`](crate::game::World);
//! the session table only changes on handshake, connect and teardown.

use crate::address::Address;
use crate::error::{Result, ServerError};
use arena_protocol::Packet;
use log::info;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// Network identity of one connected player
#[derive(Debug, Clone)]
pub struct Session {
    /// Slot id, unique among live sessions only
    pub slot: u8,
    pub address: Address,
    /// Stable account id, empty until authenticated
    pub account: String,
    /// Display name, empty until authenticated
    pub name: String,
    /// Whether the connect packet was accepted
    pub initialized: bool,
    /// Outbound queue drained by the connection's writer task
    pub tcp_tx: mpsc::Sender<Packet>,
    pub connected_at: Instant,
}

impl Session {
    /// Creates an unauthenticated stub right after the handshake.
    pub fn new(slot: u8, address: Address, tcp_tx: mpsc::Sender<Packet>) -> Self {
        Self {
            slot,
            address,
            account: String::new(),
            name: String::new(),
            initialized: false,
            tcp_tx,
            connected_at: Instant::now(),
        }
    }
}

/// Slot table for all live sessions
pub struct SessionManager {
    sessions: BTreeMap<u8, Session>,
    capacity: usize,
}

impl SessionManager {
    /// Creates an empty table with room for `capacity` slots (at most 256).
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            capacity: capacity.min(crate::config::MAX_SLOTS),
        }
    }

    /// Registers a new session in the lowest free slot.
    pub fn allocate(&mut self, address: Address, tcp_tx: mpsc::Sender<Packet>) -> Result<u8> {
        let slot = (0..self.capacity)
            .map(|s| s as u8)
            .find(|s| !self.sessions.contains_key(s))
            .ok_or(ServerError::ServerFull)?;

        info!("Slot {} allocated to {}", slot, address);
        self.sessions
            .insert(slot, Session::new(slot, address, tcp_tx));
        Ok(slot)
    }

    /// Removes a session and frees its slot. Dropping the returned session
    /// closes its TCP queue.
    pub fn remove(&mut self, slot: u8) -> Option<Session> {
        let session = self.sessions.remove(&slot)?;
        info!("Slot {} released ({})", slot, session.address);
        Some(session)
    }

    pub fn get(&self, slot: u8) -> Option<&Session> {
        self.sessions.get(&slot)
    }

    /// Finds the session whose TCP or UDP endpoint matches `address`.
    pub fn find_by_address(&self, address: &Address) -> Option<&Session> {
        self.sessions.values().find(|s| s.address == *address)
    }

    pub fn find_by_account(&self, account: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.initialized && s.account == account)
    }

    /// Marks a session as authenticated. Returns false when the slot is gone.
    pub fn authenticate(&mut self, slot: u8, account: &str, name: &str) -> bool {
        match self.sessions.get_mut(&slot) {
            Some(session) => {
                session.account = account.to_string();
                session.name = name.to_string();
                session.initialized = true;
                true
            }
            None => false,
        }
    }

    /// Authenticated sessions in slot order.
    pub fn authenticated(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.initialized)
    }

    pub fn player_names(&self) -> Vec<String> {
        self.authenticated().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
