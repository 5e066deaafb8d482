//! Server network layer handling TCP sessions, UDP traffic and task wiring

use crate::address::{Address, UdpOutbound};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::game::{GameCommand, World};
use crate::handlers::{self, Dispatcher, HandlerRegistry, ServerContext};
use crate::heartbeat::Heartbeat;
use crate::reassembly::{Reassembler, FRAGMENT_TIMEOUT};
use crate::services::{AchievementNotice, Services};
use crate::session_manager::SessionManager;
use crate::tick::TickLoop;
use arena_protocol::framing::{frame, frame_len, FRAME_PREFIX_LEN};
use arena_protocol::{Packet, TransportKind};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, RwLock};

/// Receive buffer size; larger than any valid datagram.
const RECV_BUFFER: usize = 2048;

/// Reads one framed datagram from the control channel.
pub async fn read_datagram<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;
    let len = frame_len(prefix).ok_or_else(|| {
        std::io::Error::new(ErrorKind::InvalidData, "frame longer than a datagram")
    })?;
    let mut datagram = vec![0u8; len];
    reader.read_exact(&mut datagram).await?;
    Ok(datagram)
}

/// Encodes and writes `packet` to the control channel, one frame per
/// datagram.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    for datagram in packet.encode()? {
        writer.write_all(&frame(&datagram)).await?;
    }
    Ok(())
}

/// Main server coordinating networking and game simulation
pub struct Server {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    world: World,
    commands: mpsc::Receiver<GameCommand>,
    udp_outbound: mpsc::Receiver<UdpOutbound>,
}

impl Server {
    /// Binds the TCP listener and a UDP socket on the same port.
    ///
    /// Port 0 picks a free TCP port, which the UDP socket then reuses.
    pub async fn bind(config: ServerConfig, services: Services) -> Result<Self> {
        config.validate()?;

        let tcp = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = tcp.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local_addr).await?);
        info!("Server listening on {} (TCP and UDP)", local_addr);

        let (commands_tx, commands) = mpsc::channel(config.channel_size);
        let (udp_queue, udp_outbound) = mpsc::channel(config.channel_size);
        let world = World::new(config.tick_interval());
        let sessions = Arc::new(RwLock::new(SessionManager::new(config.player_capacity())));

        Ok(Server {
            tcp,
            udp,
            local_addr,
            context: Arc::new(ServerContext {
                config: Arc::new(config),
                sessions,
                commands: commands_tx,
                udp_queue,
                services,
            }),
            world,
            commands,
            udp_outbound,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The world before the simulation starts, e.g. to add entities.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Spawns the network tasks and runs the simulation on this task.
    pub async fn run(self) -> Result<()> {
        let context = self.context;
        let dispatcher = Arc::new(Dispatcher::new(
            HandlerRegistry::with_game_handlers(),
            Arc::clone(&context),
        ));

        tokio::spawn(Self::accept_connections(
            self.tcp,
            Arc::clone(&context),
            Arc::clone(&dispatcher),
        ));
        tokio::spawn(Self::receive_datagrams(Arc::clone(&self.udp), dispatcher));
        tokio::spawn(Self::send_datagrams(self.udp, self.udp_outbound));
        tokio::spawn(Self::announce_achievements(
            context.services.notices.subscribe(),
            Arc::clone(&context),
        ));

        match (&context.services.http, context.config.register_server) {
            (Some(client), true) => {
                let heartbeat = Heartbeat::new(
                    client.clone(),
                    Arc::clone(&context.config),
                    Arc::clone(&context.sessions),
                );
                tokio::spawn(heartbeat.run());
            }
            _ => debug!("Master server registration disabled"),
        }

        TickLoop {
            world: self.world,
            commands: self.commands,
            sessions: Arc::clone(&context.sessions),
            udp_queue: context.udp_queue.clone(),
            achievements: Arc::clone(&context.services.achievements),
            interval: context.config.tick_interval(),
        }
        .run()
        .await;
        Ok(())
    }

    async fn accept_connections(
        listener: TcpListener,
        context: Arc<ServerContext>,
        dispatcher: Arc<Dispatcher>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let context = Arc::clone(&context);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        match Self::handle_connection(stream, peer, context, dispatcher).await {
                            Ok(()) => {}
                            Err(ServerError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                                info!("{} closed the connection", peer)
                            }
                            Err(e) => warn!("Connection with {} ended: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Runs one control connection from handshake to teardown.
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        context: Arc<ServerContext>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", peer, e);
        }
        let (mut reader, mut writer) = stream.into_split();

        let mut first = Packet::decode_single(&read_datagram(&mut reader).await?)?;
        first.kind = TransportKind::Tcp;
        let (reply, udp_port) = handlers::handshake(&first);
        write_packet(&mut writer, &reply).await?;
        let udp_port = udp_port.ok_or_else(|| {
            ServerError::HandshakeRejected(format!("invalid handshake from {}", peer))
        })?;

        let address = Address {
            tcp: Some(peer),
            udp: Some(SocketAddr::new(peer.ip(), udp_port)),
        };
        let (tcp_tx, tcp_rx) = mpsc::channel(context.config.channel_size);
        let allocated = context.sessions.write().await.allocate(address, tcp_tx);
        let slot = match allocated {
            Ok(slot) => slot,
            Err(e) => {
                if let Err(kick_error) =
                    write_packet(&mut writer, &handlers::kick_packet("Server is full")).await
                {
                    debug!("Could not notify {}: {}", peer, kick_error);
                }
                return Err(e);
            }
        };

        tokio::spawn(Self::drain_control_queue(writer, tcp_rx, peer));
        let result = Self::read_control_channel(&mut reader, address, slot, &dispatcher).await;
        context.release(slot, Some(peer)).await;
        result
    }

    /// Reads packets until the connection fails; any error ends the session.
    async fn read_control_channel<R: AsyncRead + Unpin>(
        reader: &mut R,
        address: Address,
        slot: u8,
        dispatcher: &Dispatcher,
    ) -> Result<()> {
        let mut reassembler = Reassembler::default();
        let peer = address.tcp.ok_or(ServerError::UnknownPeer)?;
        loop {
            let mut fragment = Packet::decode_single(&read_datagram(reader).await?)?;
            fragment.kind = TransportKind::Tcp;
            if let Some(packet) = reassembler.push(peer, fragment, Instant::now())? {
                dispatcher.handle(address, packet, Some(slot)).await;
            }
        }
    }

    /// Writes queued packets until every sender of the queue is gone.
    async fn drain_control_queue(
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::Receiver<Packet>,
        peer: SocketAddr,
    ) {
        while let Some(packet) = queue.recv().await {
            if let Err(e) = write_packet(&mut writer, &packet).await {
                debug!("Failed to write to {}: {}", peer, e);
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Failed to shut down connection to {}: {}", peer, e);
        }
    }

    async fn receive_datagrams(socket: Arc<UdpSocket>, dispatcher: Arc<Dispatcher>) {
        let mut buffer = [0u8; RECV_BUFFER];
        let mut reassembler = Reassembler::default();
        let mut expiry = tokio::time::interval(FRAGMENT_TIMEOUT);

        loop {
            let (len, addr) = tokio::select! {
                received = socket.recv_from(&mut buffer) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
                _ = expiry.tick() => {
                    let dropped = reassembler.expire(Instant::now());
                    if dropped > 0 {
                        debug!("Discarded {} incomplete split packets", dropped);
                    }
                    continue;
                }
            };

            let fragment = match Packet::decode_single(&buffer[..len]) {
                Ok(fragment) => fragment,
                Err(e) => {
                    warn!("Dropping datagram from {}: {}", addr, e);
                    continue;
                }
            };
            let origin = Address::from_udp(addr);
            // only connected players may make the server buffer fragments
            if fragment.total > 1 && !dispatcher.is_known(&origin).await {
                debug!("Dropping fragment of packet {:#04x} from unknown {}", fragment.id, addr);
                continue;
            }
            match reassembler.push(addr, fragment, Instant::now()) {
                Ok(Some(packet)) => {
                    dispatcher.dispatch(origin, packet, None);
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping split packet from {}: {}", addr, e),
            }
        }
    }

    /// Forwards achievement notices from the account API to chat.
    async fn announce_achievements(
        mut notices: broadcast::Receiver<AchievementNotice>,
        context: Arc<ServerContext>,
    ) {
        loop {
            match notices.recv().await {
                Ok(notice) => context.announce_achievement(&notice).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} achievement notices", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn send_datagrams(socket: Arc<UdpSocket>, mut queue: mpsc::Receiver<UdpOutbound>) {
        while let Some(UdpOutbound { addr, packet }) = queue.recv().await {
            let datagrams = match packet.encode() {
                Ok(datagrams) => datagrams,
                Err(e) => {
                    warn!("Cannot encode packet {:#04x} for {}: {}", packet.id, addr, e);
                    continue;
                }
            };
            for datagram in datagrams {
                if let Err(e) = socket.send_to(&datagram, addr).await {
                    debug!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        }
    }
}
