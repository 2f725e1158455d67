//! The BitTorrent peer handshake.
//!
//! The handshake is the first exchange on a fresh connection. It proves
//! both ends speak the same protocol and are talking about the same
//! torrent (via the info-hash) before any wire messages flow.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Fixed 68-byte handshake frame:
/// `pstrlen(1)=19 | pstr(19) | reserved(8)=0 | info_hash(20) | peer_id(20)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads a peer's handshake from the stream.
    ///
    /// Fails with [`PeerError::InvalidProtocol`] unless the length prefix
    /// is 19 and the protocol string matches exactly. The received peer id
    /// is recorded as-is; the info-hash is checked separately with
    /// [`Handshake::validate`] so callers decide what to compare against.
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> PeerResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        if length_buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidProtocol);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;
        if &buf[0..19] != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Checks that this handshake's info-hash matches the torrent we are
    /// downloading.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_fixed_layout() {
        let hs = Handshake::new([0xaa; 20], [0xbb; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0xaa; 20]);
        assert_eq!(&bytes[48..68], &[0xbb; 20]);
    }

    #[tokio::test]
    async fn round_trips() {
        let hs = Handshake::new(*b"01234567890123456789", *b"abcdefghijabcdefghij");
        let bytes = hs.serialize();
        let parsed = Handshake::read(&mut &bytes[..]).await.unwrap();
        assert_eq!(parsed, hs);
        assert!(parsed.validate(b"01234567890123456789").is_ok());
    }

    #[tokio::test]
    async fn rejects_wrong_protocol() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(
            Handshake::read(&mut &bytes[..]).await,
            Err(PeerError::InvalidProtocol)
        ));

        let mut bytes = Handshake::new([0; 20], [0; 20]).serialize();
        bytes[5] = b'x';
        assert!(matches!(
            Handshake::read(&mut &bytes[..]).await,
            Err(PeerError::InvalidProtocol)
        ));
    }

    #[tokio::test]
    async fn flags_info_hash_mismatch() {
        let bytes = Handshake::new([1; 20], [2; 20]).serialize();
        let parsed = Handshake::read(&mut &bytes[..]).await.unwrap();
        assert!(matches!(
            parsed.validate(&[9; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
    }
}
