//! Tracker client for the BitTorrent HTTP announce protocol.
//!
//! The client announces a torrent to its tracker and parses the bencoded
//! response into peer endpoints, handling both the compact byte-string
//! form and the list-of-dicts form. Peer ID generation and the raw-byte
//! URL escaping the protocol demands live here too.
use crate::metainfo::TorrentMeta;
use rand::Rng;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Port reported to the tracker. The core never listens for inbound
/// connections, but the announce requires one; 6881 is the convention.
pub const ANNOUNCE_PORT: u16 = 6881;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),

    #[error("announce request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker refused announce: {0}")]
    Failure(String),

    #[error("tracker response missing peers")]
    MissingPeers,

    #[error("compact peer list length is not a multiple of 6")]
    InvalidCompactPeers,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer endpoint returned by the tracker: IPv4 address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

/// Parsed tracker announce response.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds the tracker asks us to wait before re-announcing.
    pub interval: i64,
    pub peers: Vec<Peer>,
}

/// Raw response shape as bencoded by trackers. `peers` is either a compact
/// byte string (6 bytes per peer) or a list of dictionaries.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    NonCompact(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// A client communicating with a BitTorrent tracker. Owns the peer ID it
/// announces with, so the same identity can be reused on the peer wire.
#[derive(Debug)]
pub struct TrackerClient {
    peer_id: [u8; 20],
    port: u16,
}

impl TrackerClient {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces the torrent and returns the tracker's peer list.
    #[tracing::instrument(skip(self, meta), fields(announce = %meta.announce), level = "debug")]
    pub async fn announce(&self, meta: &TorrentMeta) -> TrackerResult<AnnounceResponse> {
        let url = self.build_announce_url(meta)?;
        tracing::debug!(%url, "announcing to tracker");

        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()?;
        let response = client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        parse_announce_response(&body)
    }

    /// Builds the announce GET URL.
    ///
    /// `info_hash` and `peer_id` carry raw bytes that are not URL-safe, so
    /// they are escaped byte-by-byte as `%XX` and appended to the query
    /// after the encoder has handled the plain parameters. The url crate
    /// keeps an already-percent-encoded query intact.
    fn build_announce_url(&self, meta: &TorrentMeta) -> TrackerResult<Url> {
        let mut url = Url::parse(&meta.announce)?;
        url.query_pairs_mut()
            .extend_pairs([
                ("port", self.port.to_string()),
                ("uploaded", "0".to_string()),
                ("downloaded", "0".to_string()),
                ("left", meta.total_length.to_string()),
                ("compact", "1".to_string()),
            ])
            .finish();

        let query = format!(
            "{}&info_hash={}&peer_id={}",
            url.query().unwrap_or(""),
            escape_bytes(&meta.info_hash),
            escape_bytes(&self.peer_id),
        );
        url.set_query(Some(&query));
        Ok(url)
    }
}

/// Parses a bencoded announce response body.
fn parse_announce_response(body: &[u8]) -> TrackerResult<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let peers = match raw.peers.ok_or(TrackerError::MissingPeers)? {
        // Compact: 4 bytes IPv4 big-endian, then 2 bytes port big-endian.
        RawPeers::Compact(blob) => {
            if blob.len() % 6 != 0 {
                return Err(TrackerError::InvalidCompactPeers);
            }
            blob.chunks_exact(6)
                .map(|chunk| Peer {
                    ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect()
        }
        // Non-compact entries with unparseable or non-IPv4 addresses are
        // skipped rather than failing the whole announce.
        RawPeers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|ip| Peer { ip, port: dict.port })
            })
            .collect(),
    };

    Ok(AnnounceResponse {
        interval: raw.interval.unwrap_or(0),
        peers,
    })
}

/// Generates this client's peer ID: an 8-byte client prefix followed by
/// 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes every byte as uppercase `%XX`, including bytes that
/// would be URL-safe. Trackers hash-compare the decoded raw bytes, so
/// over-escaping is the safe and conventional form.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        out.push_str(&format!("%{:02X}", b));
    }
    out
}
