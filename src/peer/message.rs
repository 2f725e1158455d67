//! Length-prefixed peer wire messages.
//!
//! Every frame after the handshake is `length(4, big-endian) | id(1) |
//! payload(length - 1)`. A zero-length frame is a keep-alive. Ids this
//! client never acts on (NotInterested, Cancel, Port, extensions) are
//! still decoded or tolerated so a chatty peer does not kill the session.
use super::{PeerError, PeerResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame we are willing to buffer. The largest legitimate
/// frame is a piece block (16 KiB + 9) or a bitfield (one bit per piece);
/// anything near this cap is a corrupt length prefix.
const MAX_FRAME_LEN: u32 = 1 << 20;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// An id outside the base protocol, accepted and ignored.
    Unknown(u8),
}

impl Message {
    /// Serializes the message into its framed wire form.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => frame_empty(&mut buf, ID_CHOKE),
            Message::Unchoke => frame_empty(&mut buf, ID_UNCHOKE),
            Message::Interested => frame_empty(&mut buf, ID_INTERESTED),
            Message::NotInterested => frame_empty(&mut buf, ID_NOT_INTERESTED),
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(ID_HAVE);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request { index, begin, length } => {
                buf.put_u32(13);
                buf.put_u8(ID_REQUEST);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(ID_PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u32(13);
                buf.put_u8(ID_CANCEL);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(ID_PORT);
                buf.put_u16(*port);
            }
            Message::Unknown(id) => frame_empty(&mut buf, *id),
        }
        buf.freeze()
    }

    fn frame_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Have(_) => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len(),
            Message::Port(_) => 3,
            _ => 1,
        }
    }

    /// Reads one framed message, blocking until a full frame arrives.
    /// A zero length prefix decodes to [`Message::KeepAlive`].
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> PeerResult<Self> {
        let mut length_buf = [0u8; 4];
        stream.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf);

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLong(length));
        }

        let mut frame = vec![0u8; length as usize];
        stream.read_exact(&mut frame).await?;
        Self::parse(frame[0], &frame[1..])
    }

    /// Writes one framed message to the stream.
    pub async fn write<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> PeerResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    /// Decodes a message from its id and payload.
    pub fn parse(id: u8, payload: &[u8]) -> PeerResult<Self> {
        let msg = match id {
            ID_CHOKE => Message::Choke,
            ID_UNCHOKE => Message::Unchoke,
            ID_INTERESTED => Message::Interested,
            ID_NOT_INTERESTED => Message::NotInterested,
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(PeerError::MalformedMessage("have"));
                }
                Message::Have(BigEndian::read_u32(payload))
            }
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST => {
                if payload.len() != 12 {
                    return Err(PeerError::MalformedMessage("request"));
                }
                Message::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::ShortPayload);
                }
                Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
            ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(PeerError::MalformedMessage("cancel"));
                }
                Message::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            ID_PORT => {
                if payload.len() != 2 {
                    return Err(PeerError::MalformedMessage("port"));
                }
                Message::Port(BigEndian::read_u16(payload))
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

fn frame_empty(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}
