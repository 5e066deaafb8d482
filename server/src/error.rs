use arena_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Decoding or field access failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No connected player matches the packet's origin.
    #[error("no player matches the packet origin")]
    UnknownPeer,

    /// An outbound packet has no route to a peer.
    #[error("no route to peer for packet {id:#04x}")]
    UnresolvedPeer { id: u8 },

    /// The acknowledged snapshot is no longer in history.
    #[error("snapshot {snapshot_id} is no longer in history")]
    StaleBaseline { snapshot_id: u32 },

    /// All player slots are taken.
    #[error("server is full")]
    ServerFull,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The receiving side of a queue is gone.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The master server answered, but not with an acknowledgement.
    #[error("unexpected master server response: {0}")]
    MasterServer(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
