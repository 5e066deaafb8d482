//! # Arena Game Server Library
//!
//! Authoritative server for the arena game. Clients hold a TCP control
//! connection for reliable messages (handshake, connect, chat, errors) and
//! exchange high-frequency state over UDP. The server runs a fixed-tick
//! simulation and streams each client a delta of the world relative to the
//! last snapshot that client acknowledged.
//!
//! ## Data Flow
//!
//! ```text
//! TCP / UDP listeners -> Packet::decode_single -> Reassembler
//!     -> Dispatcher (resolves the Session) -> handler
//!     -> GameCommand queue -> tick task (World)
//!     -> delta encoder -> UDP queue -> UDP send loop
//! ```
//!
//! ## Concurrency Model
//!
//! ### Single Writer
//! The tick task owns the [`game::World`] outright. Handlers never mutate
//! gameplay state; they send a [`game::GameCommand`] over a bounded queue
//! that the tick drains before integrating. Snapshots therefore always copy
//! a consistent world.
//!
//! ### Session Table
//! Network identity (slot, address, account, control queue) lives in the
//! [`session_manager::SessionManager`] behind a `tokio::sync::RwLock`. It is
//! written on handshake, authenticated connect and teardown only.
//!
//! ### Tasks
//! - **Accept loop**: one task per control connection, plus one writer task
//!   draining that connection's outbound queue. The connection task runs
//!   its handlers itself, one packet at a time, so a client's TCP packets
//!   are handled in the order it sent them
//! - **UDP receiver**: decodes, reassembles and dispatches every datagram;
//!   only connected players get fragments buffered
//! - **UDP sender**: drains the shared outbound UDP queue
//! - **Handler tasks**: one short-lived task per UDP packet
//! - **Achievement announcer**: posts confirmed unlocks to chat
//! - **Tick task**: integrate, prune, snapshot, diff and send, then sleep
//! - **Heartbeat**: optional master server registration
//!
//! ## Snapshot Synchronization
//!
//! Every tick produces a new [`snapshot::WorldSnapshot`] kept for ten
//! seconds. Clients acknowledge snapshot ids; the acknowledged snapshot is
//! the baseline the next delta is computed against. Players missing from a
//! baseline (or receivers without one) get full state, so a lost datagram
//! costs one resend and never desynchronizes a client.
//!
//! ## Module Organization
//!
//! - [`address`]: endpoint pairs and outbound routing
//! - [`session_manager`]: slot allocation and session lookup
//! - [`network`]: listeners, control channel framing and task wiring
//! - [`reassembly`]: buffering of split packets per source
//! - [`handlers`]: handler registry, dispatcher and packet handlers
//! - [`game`], [`player`], [`snapshot`], [`delta`], [`tick`]: simulation
//! - [`services`], [`achievements`], [`heartbeat`]: external collaborators
//! - [`config`], [`error`]: configuration and the error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use arena_server::config::ServerConfig;
//! use arena_server::network::Server;
//! use arena_server::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load_or_create("server.toml")?;
//!     let services = Services::http(&config)?;
//!
//!     let server = Server::bind(config, services).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod achievements;
pub mod address;
pub mod config;
pub mod delta;
pub mod error;
pub mod game;
pub mod handlers;
pub mod heartbeat;
pub mod network;
pub mod player;
pub mod reassembly;
pub mod services;
pub mod session_manager;
pub mod snapshot;
pub mod tick;

pub use error::{Result, ServerError};
