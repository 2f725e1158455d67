//! Torrent registry and the surface external collaborators use.
//!
//! A UI or control API hands raw torrent bytes to [`Manager::add_torrent`]
//! and polls [`Manager::get_stats`]; everything in between (announce,
//! worker pool, persistence) happens on a background task per torrent.
use crate::engine::Torrent;
use crate::metainfo::{self, MetainfoError};
use crate::tracker::{TrackerClient, TrackerError, ANNOUNCE_PORT};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to parse torrent: {0}")]
    Parse(#[from] MetainfoError),

    #[error("failed to reach tracker: {0}")]
    Tracker(#[from] TrackerError),

    #[error("torrent is already registered")]
    AlreadyPresent,
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

/// Point-in-time snapshot of one torrent, shaped for JSON consumers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentStats {
    pub name: String,
    pub percent: f64,
    pub downloaded: usize,
    pub total_length: usize,
    pub peers: usize,
    pub info_hash: String,
}

struct TorrentEntry {
    torrent: Arc<Torrent>,
    /// Coordinator task handle; aborting it is how a torrent is cancelled.
    task: JoinHandle<()>,
}

/// Registry of active torrents, keyed by hex info-hash.
#[derive(Default)]
pub struct Manager {
    torrents: RwLock<HashMap<String, TorrentEntry>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses, announces, and registers a torrent, then starts its
    /// download in the background. Synchronous up to the announce so the
    /// caller learns about unusable input immediately.
    pub async fn add_torrent(&self, data: &[u8]) -> ManagerResult<()> {
        let meta = metainfo::parse_torrent(data)?;
        let key = hex::encode(meta.info_hash);

        // Fail fast before spending a tracker round-trip; checked again
        // under the write lock at insert.
        if self.torrents.read().await.contains_key(&key) {
            return Err(ManagerError::AlreadyPresent);
        }

        let client = TrackerClient::new(ANNOUNCE_PORT);
        let response = client.announce(&meta).await?;
        info!(
            name = %meta.name,
            peers = response.peers.len(),
            "tracker announce succeeded"
        );

        let torrent = Arc::new(Torrent::new(&meta, response.peers, client.peer_id()));

        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&key) {
            return Err(ManagerError::AlreadyPresent);
        }

        info!(name = %meta.name, info_hash = %key, "starting background download");
        let task = tokio::spawn(Arc::clone(&torrent).download());
        torrents.insert(key, TorrentEntry { torrent, task });
        Ok(())
    }

    /// Consistent snapshot of every registered torrent.
    pub async fn get_stats(&self) -> Vec<TorrentStats> {
        let torrents = self.torrents.read().await;
        torrents
            .iter()
            .map(|(key, entry)| TorrentStats {
                name: entry.torrent.name.clone(),
                percent: entry.torrent.percent(),
                downloaded: entry.torrent.bytes_downloaded(),
                total_length: entry.torrent.total_length,
                peers: entry.torrent.peers.len(),
                info_hash: key.clone(),
            })
            .collect()
    }

    /// Cancels and forgets a torrent. Returns false if the info-hash was
    /// not registered. Data already on disk stays; a later add resumes
    /// from it.
    pub async fn remove_torrent(&self, info_hash_hex: &str) -> bool {
        match self.torrents.write().await.remove(info_hash_hex) {
            Some(entry) => {
                entry.task.abort();
                info!(info_hash = %info_hash_hex, "torrent removed");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves bencoded announce bodies over bare HTTP, one response per
    /// connection, forever.
    async fn run_tracker(listener: TcpListener, body: Vec<u8>) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            // Drain the request head before answering.
            let mut request = Vec::new();
            let mut chunk = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&chunk[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        }
    }

    /// Torrent file whose single piece is `content`, announcing to a
    /// local tracker URL.
    fn build_torrent_file(announce: &str, name: &str, content: &[u8]) -> Vec<u8> {
        let hash: [u8; 20] = Sha1::digest(content).into();
        let mut data = Vec::new();
        data.extend_from_slice(
            format!("d8:announce{}:{}4:info", announce.len(), announce).as_bytes(),
        );
        data.extend_from_slice(
            format!(
                "d6:lengthi{}e4:name{}:{}12:piece lengthi16384e6:pieces20:",
                content.len(),
                name.len(),
                name
            )
            .as_bytes(),
        );
        data.extend_from_slice(&hash);
        data.extend_from_slice(b"ee");
        data
    }

    fn compact_peers_body(port: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&port.to_be_bytes());
        body.extend_from_slice(b"e");
        body
    }

    #[tokio::test]
    async fn add_reports_stats_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("blob").to_str().unwrap().to_string();
        let content = b"hello torrent".to_vec();
        // Content already on disk: the resume pass finishes the download
        // without any seeder.
        std::fs::write(&name, &content).unwrap();

        let tracker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_url = format!("http://127.0.0.1:{}/announce", tracker.local_addr().unwrap().port());
        tokio::spawn(run_tracker(tracker, compact_peers_body(6881)));

        let torrent_file = build_torrent_file(&tracker_url, &name, &content);
        let expected_hash = {
            let meta = crate::metainfo::parse_torrent(&torrent_file).unwrap();
            hex::encode(meta.info_hash)
        };

        let manager = Manager::new();
        manager.add_torrent(&torrent_file).await.unwrap();

        assert!(matches!(
            manager.add_torrent(&torrent_file).await,
            Err(ManagerError::AlreadyPresent)
        ));

        // The resume pass runs on the background task; poll for it.
        let mut percent = 0.0;
        for _ in 0..50 {
            let stats = manager.get_stats().await;
            percent = stats[0].percent;
            if percent == 100.0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(percent, 100.0);

        let stats = manager.get_stats().await;
        assert_eq!(
            stats,
            vec![TorrentStats {
                name: name.clone(),
                percent: 100.0,
                downloaded: content.len(),
                total_length: content.len(),
                peers: 1,
                info_hash: expected_hash.clone(),
            }]
        );

        assert!(manager.remove_torrent(&expected_hash).await);
        assert!(!manager.remove_torrent(&expected_hash).await);
        assert!(manager.get_stats().await.is_empty());
    }

    #[tokio::test]
    async fn surfaces_tracker_failure() {
        let tracker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tracker_url = format!("http://127.0.0.1:{}/announce", tracker.local_addr().unwrap().port());
        tokio::spawn(run_tracker(
            tracker,
            b"d14:failure reason9:not founde".to_vec(),
        ));

        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("x").to_str().unwrap().to_string();
        let torrent_file = build_torrent_file(&tracker_url, &name, b"abc");

        let manager = Manager::new();
        assert!(matches!(
            manager.add_torrent(&torrent_file).await,
            Err(ManagerError::Tracker(TrackerError::Failure(_)))
        ));
        assert!(manager.get_stats().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_torrent() {
        let manager = Manager::new();
        assert!(matches!(
            manager.add_torrent(b"not bencode").await,
            Err(ManagerError::Parse(_))
        ));
    }

    #[test]
    fn stats_serialize_with_camel_case_keys() {
        let stats = TorrentStats {
            name: "a".into(),
            percent: 50.0,
            downloaded: 10,
            total_length: 20,
            peers: 3,
            info_hash: "ff".into(),
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"totalLength\":20"));
        assert!(json.contains("\"infoHash\":\"ff\""));
    }
}
