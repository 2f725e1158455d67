//! Peer wire protocol: handshake, length-prefixed messages, piece
//! bitfields, and per-piece assembly buffers.
use thiserror::Error;
pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod progress;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use progress::PieceProgress;

/// Errors on a single peer session. All of these are transient from the
/// torrent's point of view: the session is dropped and its work requeued.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid handshake protocol header")]
    InvalidProtocol,

    #[error("handshake info hash mismatch")]
    InfoHashMismatch,

    #[error("oversized message frame: {0} bytes")]
    FrameTooLong(u32),

    #[error("malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("piece payload too short")]
    ShortPayload,

    #[error("block out of bounds: begin {begin}, len {len}")]
    OutOfBounds { begin: usize, len: usize },

    #[error("piece {index} failed hash check")]
    HashMismatch { index: u32 },

    #[error("no message within the piece deadline")]
    PieceTimeout,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
