//! Packet handlers and the dispatcher that runs them
//!
//! The [`HandlerRegistry`] maps every packet id to at most one handler.
//! [`Dispatcher::handle`] resolves the player behind a packet and runs its
//! handler. Control connections await it packet by packet, so one client's
//! TCP stream is handled in order while connections run side by side. UDP
//! packets go through [`Dispatcher::dispatch`], which spawns a task each so
//! the shared receive loop never waits on a handler.
//!
//! Handlers never touch the simulation directly. Anything that changes
//! gameplay state is sent to the tick task as a [`GameCommand`].
//!
//! Failed handlers answer with the standard error packet: the failing id
//! with a single zero byte, over TCP. Packets that arrived over UDP have no
//! safe reply target, so their failures are only logged.

use crate::address::{Address, UdpOutbound};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::game::GameCommand;
use crate::player::{clamp_name, Motion, Vector3};
use crate::services::{AchievementNotice, Services};
use crate::session_manager::{Session, SessionManager};
use arena_protocol::{ids, Packet, TransportKind, INFO_CHANGE_PAYLOAD_LEN, MOVEMENT_PAYLOAD_LEN};
use log::{debug, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
pub type Handler = for<'a> fn(&'a HandlerContext, Packet) -> HandlerFuture<'a>;

/// Longest account id accepted at connect.
pub const MAX_ACCOUNT_LEN: usize = 64;

/// State shared by every connection, handler and background task.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub commands: mpsc::Sender<GameCommand>,
    pub udp_queue: mpsc::Sender<UdpOutbound>,
    pub services: Services,
}

impl ServerContext {
    pub async fn submit(&self, command: GameCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServerError::ChannelClosed("game command"))
    }

    /// Sends a chat line to every authenticated player.
    pub async fn broadcast_chat(&self, message: &str) {
        let packet = chat_packet(message);
        let sessions = self.sessions.read().await;
        for session in sessions.authenticated() {
            if session.tcp_tx.try_send(packet.clone()).is_err() {
                debug!("Chat to slot {} dropped, control queue unavailable", session.slot);
            }
        }
    }

    /// Announces a confirmed achievement under the player's display name.
    pub async fn announce_achievement(&self, notice: &AchievementNotice) {
        let name = self
            .sessions
            .read()
            .await
            .find_by_account(&notice.account)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| notice.account.clone());
        info!("{} has unlocked the achievement {}", name, notice.title);
        self.broadcast_chat(&format!("> {} has unlocked the achievement {}!", name, notice.title))
            .await;
    }

    /// Releases `slot` if it still belongs to the connection at `tcp`.
    ///
    /// Dropping the session closes its control queue, which ends the
    /// connection's writer task. Returns false when there was nothing to
    /// release, so calling it twice is harmless.
    pub async fn release(&self, slot: u8, tcp: Option<SocketAddr>) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions.get(slot).is_some_and(|s| s.address.tcp == tcp);
            if owned {
                sessions.remove(slot)
            } else {
                None
            }
        };
        let Some(session) = session else {
            return false;
        };

        if session.initialized {
            if let Err(e) = self.submit(GameCommand::Leave { slot }).await {
                warn!("Could not remove slot {} from the world: {}", slot, e);
            }
            info!("{} has left the game", session.name);
            self.broadcast_chat(&format!("{} has left the game", session.name))
                .await;
        }
        true
    }
}

pub fn chat_packet(message: &str) -> Packet {
    let mut packet = Packet::tcp(ids::CHAT);
    packet.add_field_string(message);
    packet
}

/// Outbound disconnect: the server drops the client with a reason.
pub fn kick_packet(reason: &str) -> Packet {
    let mut packet = Packet::tcp(ids::DISCONNECT);
    packet.add_field_string(reason);
    packet
}

/// What one handler invocation knows about its packet's origin.
pub struct HandlerContext {
    pub server: Arc<ServerContext>,
    pub origin: Address,
    /// Session as it was when the handler started
    pub player: Option<Session>,
}

impl HandlerContext {
    /// Sends `packet` back to the origin.
    pub async fn answer(&self, packet: Packet) -> Result<()> {
        self.origin
            .send(packet, self.player.as_ref(), &self.server.udp_queue)
            .await
    }

    /// Standard error reply on `id`.
    pub async fn error(&self, id: u8) -> Result<()> {
        let mut packet = Packet::tcp(id);
        packet.add_field_bytes([0]);
        self.answer(packet).await
    }

    /// The authenticated player that sent the packet.
    pub fn player(&self) -> Result<&Session> {
        self.player
            .as_ref()
            .filter(|p| p.initialized)
            .ok_or(ServerError::UnknownPeer)
    }

    async fn fail(&self, id: u8, kind: TransportKind, error: ServerError) {
        match kind {
            TransportKind::Tcp if self.player.is_some() => {
                debug!("Packet {:#04x} from {} failed: {}", id, self.origin, error);
                if let Err(e) = self.error(id).await {
                    debug!("Error reply to {} not sent: {}", self.origin, e);
                }
            }
            _ => debug!(
                "Dropped packet {:#04x} from {}: {}",
                id, self.origin, error
            ),
        }
    }
}

/// Packet id to handler table.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: [Option<Handler>; 256],
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: [None; 256],
        }
    }

    pub fn register(&mut self, id: u8, handler: Handler) {
        self.handlers[id as usize] = Some(handler);
    }

    pub fn get(&self, id: u8) -> Option<Handler> {
        self.handlers[id as usize]
    }

    /// Handlers for every packet the server understands after the
    /// handshake.
    pub fn with_game_handlers() -> Self {
        let mut registry = Self::empty();
        registry.register(ids::CONNECT, connect);
        registry.register(ids::DISCONNECT, disconnect);
        registry.register(ids::CHAT, chat);
        registry.register(ids::ACK, acknowledge);
        registry.register(ids::MOVEMENT, movement);
        registry.register(ids::INFO_CHANGE, info_change);
        registry.register(ids::DAMAGE, damage);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_game_handlers()
    }
}

pub struct Dispatcher {
    registry: HandlerRegistry,
    server: Arc<ServerContext>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, server: Arc<ServerContext>) -> Self {
        Self { registry, server }
    }

    /// Runs the handler of `packet` on a new task.
    ///
    /// Used for UDP input, where packets carry no ordering anyway. Unknown
    /// ids are dropped silently and get no task.
    pub fn dispatch(
        self: &Arc<Self>,
        origin: Address,
        packet: Packet,
        slot: Option<u8>,
    ) -> Option<JoinHandle<()>> {
        if self.registry.get(packet.id).is_none() {
            debug!("Dropping packet with unknown id {:#04x} from {}", packet.id, origin);
            return None;
        }
        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            dispatcher.handle(origin, packet, slot).await;
        }))
    }

    /// Resolves the sender of `packet` and runs its handler to completion.
    ///
    /// A control connection awaits this for every packet it reads, so its
    /// packets are handled in the order they were sent. `slot` is known for
    /// those; UDP packets are matched by endpoint.
    pub async fn handle(&self, origin: Address, packet: Packet, slot: Option<u8>) {
        let Some(handler) = self.registry.get(packet.id) else {
            debug!("Dropping packet with unknown id {:#04x} from {}", packet.id, origin);
            return;
        };

        let player = {
            let sessions = self.server.sessions.read().await;
            match slot {
                Some(slot) => sessions.get(slot).filter(|s| s.address == origin).cloned(),
                None => sessions.find_by_address(&origin).cloned(),
            }
        };
        let context = HandlerContext {
            server: Arc::clone(&self.server),
            origin,
            player,
        };

        let id = packet.id;
        let kind = packet.kind;
        // connect is the only packet an unauthenticated stub may send
        let resolved = match id {
            ids::CONNECT => context.player.is_some(),
            _ => context.player().is_ok(),
        };
        let result = if resolved {
            handler(&context, packet).await
        } else {
            Err(ServerError::UnknownPeer)
        };
        if let Err(e) = result {
            context.fail(id, kind, e).await;
        }
    }

    /// Whether `origin` belongs to a connected session.
    pub async fn is_known(&self, origin: &Address) -> bool {
        self.server.sessions.read().await.find_by_address(origin).is_some()
    }
}

/// Checks a handshake packet. Returns the reply and, on success, the UDP
/// port the client announced.
pub fn handshake(packet: &Packet) -> (Packet, Option<u16>) {
    let mut reply = Packet::tcp(ids::HANDSHAKE);
    let version = packet.get_u8(0).ok();
    let port = packet
        .get_u32_le(1)
        .ok()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0);

    match (packet.id, version, port) {
        (ids::HANDSHAKE, Some(arena_protocol::PROTOCOL_VERSION), Some(port)) => {
            reply.add_field_bytes([arena_protocol::PROTOCOL_VERSION]);
            (reply, Some(port))
        }
        _ => {
            reply.add_field_bytes([0]);
            (reply, None)
        }
    }
}

fn connect(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let stub = ctx.player.as_ref().ok_or(ServerError::UnknownPeer)?;
        if stub.initialized {
            return Err(ServerError::HandshakeRejected("already connected".to_string()));
        }
        let account = packet.get_field_string(0)?;
        let token = packet.get_field_string(account.len() + 1)?;

        let mut denied = Packet::tcp(ids::CONNECT);
        denied.add_field_bytes([0]);

        if account.is_empty() || account.len() > MAX_ACCOUNT_LEN {
            info!(
                "Connection from {} denied: account id of {} bytes",
                ctx.origin,
                account.len()
            );
            return ctx.answer(denied).await;
        }

        let taken = ctx
            .server
            .sessions
            .read()
            .await
            .find_by_account(&account)
            .is_some();
        if taken {
            info!("{} tried to connect twice", account);
            return ctx.answer(denied).await;
        }

        let auth = &ctx.server.services.auth;
        if !auth.check(&account, &token).await {
            info!("Connection of {} denied: invalid token", account);
            return ctx.answer(denied).await;
        }
        let name = clamp_name(&auth.display_name(&account).await).to_string();

        let authenticated = {
            let mut sessions = ctx.server.sessions.write().await;
            if sessions.find_by_account(&account).is_some() {
                None
            } else if sessions.authenticate(stub.slot, &account, &name) {
                sessions.get(stub.slot).map(|s| s.address.udp)
            } else {
                return Err(ServerError::UnknownPeer);
            }
        };
        let Some(udp) = authenticated else {
            return ctx.answer(denied).await;
        };

        ctx.server
            .submit(GameCommand::Join {
                slot: stub.slot,
                account: account.clone(),
                name: name.clone(),
                udp,
            })
            .await?;

        let mut accepted = Packet::tcp(ids::CONNECT);
        accepted
            .add_field_bytes([1])
            .add_field_string(ctx.server.config.current_map());
        ctx.answer(accepted).await?;

        info!("{} ({}) has joined the game in slot {}", name, account, stub.slot);
        if ctx.server.config.is_operator(&account) {
            info!("{} is an operator", name);
        }
        ctx.server
            .broadcast_chat(&format!("{} has joined the game", name))
            .await;
        Ok(())
    })
}

fn disconnect(ctx: &HandlerContext, _packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        ctx.server.release(player.slot, player.address.tcp).await;
        Ok(())
    })
}

fn chat(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        let message = packet.get_field_string(0)?;
        if message.is_empty() {
            return Ok(());
        }
        info!("<{}> {}", player.name, message);
        ctx.server
            .broadcast_chat(&format!("{}: {}", player.name, message))
            .await;
        Ok(())
    })
}

fn acknowledge(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        let snapshot_id = packet.get_u32_le(0)?;
        ctx.server
            .submit(GameCommand::Acknowledge {
                slot: player.slot,
                snapshot_id,
            })
            .await
    })
}

fn movement(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        packet.get_field(0, MOVEMENT_PAYLOAD_LEN)?;
        let f = |i: usize| packet.get_f32_le(i * 4);
        let motion = Motion {
            position: Vector3::new(f(0)?, f(1)?, f(2)?),
            rotation: Vector3::new(f(3)?, f(4)?, 0.0),
            velocity: Vector3::new(f(5)?, f(6)?, f(7)?),
            angular_velocity: Vector3::new(f(8)?, f(9)?, 0.0),
        };
        ctx.server
            .submit(GameCommand::Move {
                slot: player.slot,
                motion,
                received_at: Instant::now(),
            })
            .await
    })
}

fn info_change(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        let info = packet.get_field(0, INFO_CHANGE_PAYLOAD_LEN)?;
        ctx.server
            .submit(GameCommand::InfoChange {
                slot: player.slot,
                weapon: info[0],
                model: info[1],
            })
            .await
    })
}

fn damage(ctx: &HandlerContext, packet: Packet) -> HandlerFuture<'_> {
    Box::pin(async move {
        let player = ctx.player()?;
        ctx.server
            .submit(GameCommand::Damage {
                attacker: player.slot,
                victim: packet.get_u8(0)?,
                amount: packet.get_u8(1)?,
            })
            .await
    })
}
