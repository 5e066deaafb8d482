//! Minimal protocol client for smoke testing a running server.
//!
//! Performs the handshake and connect exchange, then walks in a circle,
//! acknowledging every snapshot it receives and printing a summary of it.

use arena_protocol::framing::{frame, frame_len, FRAME_PREFIX_LEN};
use arena_protocol::{ids, Packet, PROTOCOL_VERSION};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{interval, timeout};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address (TCP and UDP share the port)
    #[clap(short, long, default_value = "127.0.0.1:1518")]
    server: SocketAddr,
    #[clap(short, long, default_value = "probe")]
    account: String,
    #[clap(short, long, default_value = "token")]
    token: String,
    /// Seconds to stay connected
    #[clap(short, long, default_value = "10")]
    duration: u64,
}

async fn send(stream: &mut TcpStream, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
    for datagram in packet.encode()? {
        stream.write_all(&frame(&datagram)).await?;
    }
    Ok(())
}

async fn receive(stream: &mut TcpStream) -> Result<Packet, Box<dyn std::error::Error>> {
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    stream.read_exact(&mut prefix).await?;
    let len = frame_len(prefix).ok_or("oversized frame")?;
    let mut datagram = vec![0u8; len];
    stream.read_exact(&mut datagram).await?;
    Ok(Packet::decode_single(&datagram)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let udp = UdpSocket::bind("0.0.0.0:0").await?;
    let udp_port = udp.local_addr()?.port();
    let mut tcp = TcpStream::connect(args.server).await?;
    println!("Connected to {}, UDP port {}", args.server, udp_port);

    let mut handshake = Packet::tcp(ids::HANDSHAKE);
    handshake
        .add_field_bytes([PROTOCOL_VERSION])
        .add_u32_le(u32::from(udp_port));
    send(&mut tcp, &handshake).await?;
    let reply = receive(&mut tcp).await?;
    if reply.get_u8(0)? != PROTOCOL_VERSION {
        return Err("handshake rejected".into());
    }
    println!("Handshake accepted");

    let mut connect = Packet::tcp(ids::CONNECT);
    connect
        .add_field_string(&args.account)
        .add_field_string(&args.token);
    send(&mut tcp, &connect).await?;
    let reply = receive(&mut tcp).await?;
    if reply.get_u8(0)? != 1 {
        return Err("connection denied".into());
    }
    println!("Joined, map is {}", reply.get_field_string(1)?);

    let mut buffer = [0u8; 2048];
    let mut ticker = interval(Duration::from_millis(50));
    let mut angle = 0.0f32;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;

        angle += 0.1;
        let mut movement = Packet::udp(ids::MOVEMENT);
        for value in [angle.cos() * 5.0, 0.0, angle.sin() * 5.0, 0.0, angle, 0.0, 0.0, 0.0, 0.0, 0.0] {
            movement.add_f32_le(value);
        }
        for datagram in movement.encode()? {
            udp.send_to(&datagram, args.server).await?;
        }

        while let Ok(Ok((len, _))) = timeout(Duration::from_millis(5), udp.recv_from(&mut buffer)).await {
            let snapshot = match Packet::decode_single(&buffer[..len]) {
                Ok(packet) if packet.id == ids::SNAPSHOT => packet,
                Ok(other) => {
                    println!("Unexpected packet {:#04x}", other.id);
                    continue;
                }
                Err(e) => {
                    println!("Bad datagram: {}", e);
                    continue;
                }
            };
            let id = snapshot.get_u32_le(0)?;
            println!(
                "Snapshot {} fragment {}/{}: {} bytes of player blocks",
                id,
                snapshot.index + 1,
                snapshot.total,
                snapshot.data.len() - 4
            );

            let mut ack = Packet::udp(ids::ACK);
            ack.add_u32_le(id);
            for datagram in ack.encode()? {
                udp.send_to(&datagram, args.server).await?;
            }
        }
    }

    send(&mut tcp, &Packet::tcp(ids::DISCONNECT)).await?;
    println!("Disconnected");
    Ok(())
}
