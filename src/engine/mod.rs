//! The piece-download engine.
//!
//! One torrent gets one coordinator and up to [`MAX_WORKERS`] per-peer
//! workers. Work is a queue of pieces still missing; any worker can pop a
//! piece, attempt it over its own peer session, and push it back when the
//! attempt fails or the peer does not have it. The coordinator is the
//! single consumer of completed pieces: it persists them, advances the
//! byte counter, and decides when the torrent is done.
use crate::metainfo::TorrentMeta;
use crate::peer::progress::MAX_BLOCK_SIZE;
use crate::peer::{Bitfield, Handshake, Message, PeerError, PeerResult, PieceProgress};
use crate::storage;
use crate::tracker::Peer;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Rolling inactivity deadline while downloading a piece: if the peer
/// sends nothing for this long, the attempt fails and the piece requeues.
const PIECE_TIMEOUT: Duration = Duration::from_secs(30);
/// Outstanding-request window per session. Five blocks in flight keeps
/// the pipe busy while bounding buffered data at 80 KiB per worker.
const PIPELINE_WINDOW: usize = 5 * MAX_BLOCK_SIZE;
/// Cap on concurrent peer sessions per torrent.
const MAX_WORKERS: usize = 30;

/// One piece still to be fetched. Lives on the work queue.
#[derive(Debug)]
struct PieceWork {
    index: usize,
    hash: [u8; 20],
    length: usize,
}

/// A completed, hash-verified piece on its way to the store.
#[derive(Debug)]
struct PieceResult {
    index: usize,
    data: Vec<u8>,
}

/// One peer connection, scoped to one worker. Peers start choked; the
/// bitfield stays unknown until the peer announces one (or sends Have).
struct PeerSession {
    stream: TcpStream,
    choked: bool,
    bitfield: Option<Bitfield>,
}

struct DownloadState {
    bytes_downloaded: usize,
    pieces_done: Bitfield,
}

/// An active download. Identity fields are immutable; progress lives
/// behind its own lock so stats readers never contend with the engine
/// for long.
pub struct Torrent {
    pub name: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: usize,
    pub total_length: usize,
    pub peers: Vec<Peer>,
    state: Mutex<DownloadState>,
}

impl Torrent {
    pub fn new(meta: &TorrentMeta, peers: Vec<Peer>, peer_id: [u8; 20]) -> Self {
        Self {
            name: meta.name.clone(),
            info_hash: meta.info_hash,
            peer_id,
            piece_hashes: meta.piece_hashes.clone(),
            piece_length: meta.piece_length,
            total_length: meta.total_length,
            peers,
            state: Mutex::new(DownloadState {
                bytes_downloaded: 0,
                pieces_done: Bitfield::with_pieces(meta.piece_hashes.len()),
            }),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Actual length of piece `index`; only the final piece falls short
    /// of `piece_length`.
    pub fn piece_size(&self, index: usize) -> usize {
        let begin = index * self.piece_length;
        self.piece_length.min(self.total_length - begin)
    }

    pub fn bytes_downloaded(&self) -> usize {
        self.state().bytes_downloaded
    }

    pub fn pieces_done(&self) -> usize {
        self.state().pieces_done.count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_done() == self.num_pieces()
    }

    pub fn percent(&self) -> f64 {
        if self.total_length == 0 {
            return 0.0;
        }
        100.0 * self.bytes_downloaded() as f64 / self.total_length as f64
    }

    fn state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap()
    }

    fn mark_piece_done(&self, index: usize, length: usize) -> bool {
        let mut state = self.state();
        if state.pieces_done.has_piece(index) {
            return false;
        }
        state.pieces_done.set_piece(index);
        state.bytes_downloaded += length;
        true
    }

    /// Runs the download to completion (or to a stall, if every peer
    /// session dies with work outstanding). Idempotent: on a torrent
    /// already fully on disk the resume pass is the only work done.
    #[tracing::instrument(skip(self), fields(name = %self.name), level = "info")]
    pub async fn download(self: Arc<Self>) {
        let piece_count = self.num_pieces();
        let (work_tx, work_rx) = mpsc::channel::<PieceWork>(piece_count.max(1));
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<PieceResult>();

        // Resume pass: anything already on disk that hashes clean is done.
        let mut done_count = 0usize;
        info!("verifying existing data");
        for index in 0..piece_count {
            let length = self.piece_size(index);
            if self.check_piece_on_disk(index, length).await {
                self.mark_piece_done(index, length);
                done_count += 1;
                continue;
            }
            let work = PieceWork {
                index,
                hash: self.piece_hashes[index],
                length,
            };
            // Capacity equals the piece count, so this never blocks.
            let _ = work_tx.send(work).await;
        }
        if done_count > 0 {
            info!(
                "resuming from {:.2}%",
                100.0 * done_count as f64 / piece_count as f64
            );
        }

        let mut workers = JoinSet::new();
        for peer in self.peers.iter().take(MAX_WORKERS) {
            let torrent = Arc::clone(&self);
            let addr = peer.addr();
            let work_tx = work_tx.clone();
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            workers.spawn(async move {
                torrent.run_worker(addr, work_tx, work_rx, result_tx).await;
            });
        }
        // Workers hold the only result senders now; when the last one
        // dies the closed channel is the stall signal.
        drop(result_tx);

        while done_count < piece_count {
            let Some(result) = result_rx.recv().await else {
                warn!(
                    missing = piece_count - done_count,
                    "all peer sessions ended; download stalled"
                );
                break;
            };
            let length = result.data.len();
            if let Err(err) =
                storage::save_piece(&self.name, result.index, self.piece_length, &result.data)
                    .await
            {
                warn!(piece = result.index, %err, "failed to persist piece; requeueing");
                let work = PieceWork {
                    index: result.index,
                    hash: self.piece_hashes[result.index],
                    length,
                };
                let _ = work_tx.send(work).await;
                continue;
            }
            if self.mark_piece_done(result.index, length) {
                done_count += 1;
            }
            debug!(
                piece = result.index,
                done = done_count,
                total = piece_count,
                "piece persisted"
            );
        }

        if done_count == piece_count {
            info!("download complete");
        }
        // Dropping the JoinSet aborts workers still idling on the queue.
    }

    /// Re-reads a piece from the store and compares its hash. The final
    /// piece is hashed over its actual length, not `piece_length`.
    async fn check_piece_on_disk(&self, index: usize, length: usize) -> bool {
        match storage::read_piece(&self.name, index, self.piece_length).await {
            Ok(data) if data.len() >= length => {
                let actual: [u8; 20] = Sha1::digest(&data[..length]).into();
                actual == self.piece_hashes[index]
            }
            _ => false,
        }
    }

    /// One worker per peer address: establish a session, then keep taking
    /// work until the queue closes or the session dies. A failed attempt
    /// puts the piece back for other workers before this one exits.
    async fn run_worker(
        self: Arc<Self>,
        addr: SocketAddr,
        work_tx: mpsc::Sender<PieceWork>,
        work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PieceWork>>>,
        result_tx: mpsc::UnboundedSender<PieceResult>,
    ) {
        let mut session = match self.establish_peer(addr).await {
            Ok(session) => session,
            Err(err) => {
                debug!(%addr, %err, "could not establish peer");
                return;
            }
        };
        debug!(%addr, "peer session established");

        loop {
            let work = {
                let mut rx = work_rx.lock().await;
                match rx.recv().await {
                    Some(work) => work,
                    None => return,
                }
            };

            if let Some(bitfield) = &session.bitfield {
                if !bitfield.has_piece(work.index) {
                    // Not ours to fetch; hand it back and look again.
                    if work_tx.send(work).await.is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            match self.attempt_download(&mut session, &work).await {
                Ok(data) => {
                    if result_tx
                        .send(PieceResult { index: work.index, data })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%addr, piece = work.index, %err, "piece attempt failed");
                    let _ = work_tx.send(work).await;
                    return;
                }
            }
        }
    }

    /// Dials the peer, swaps handshakes, and declares interest.
    async fn establish_peer(&self, addr: SocketAddr) -> PeerResult<PeerSession> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;

        let handshake = Handshake::new(self.info_hash, self.peer_id);
        stream.write_all(&handshake.serialize()).await?;
        let reply = timeout(HANDSHAKE_TIMEOUT, Handshake::read(&mut stream))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        reply.validate(&self.info_hash)?;

        Message::Interested.write(&mut stream).await?;

        Ok(PeerSession {
            stream,
            choked: true,
            bitfield: None,
        })
    }

    /// Downloads one piece over an established session.
    ///
    /// While unchoked, keeps up to [`PIPELINE_WINDOW`] bytes of requests
    /// in flight; blocks may arrive in any order. Each message read runs
    /// under the rolling [`PIECE_TIMEOUT`].
    async fn attempt_download(
        &self,
        session: &mut PeerSession,
        work: &PieceWork,
    ) -> PeerResult<Vec<u8>> {
        let mut progress = PieceProgress::new(work.index as u32, work.length);

        while progress.downloaded() < work.length {
            if !session.choked {
                while progress.requested() < work.length
                    && progress.requested().saturating_sub(progress.downloaded())
                        < PIPELINE_WINDOW
                {
                    let block_size = MAX_BLOCK_SIZE.min(work.length - progress.requested());
                    Message::Request {
                        index: work.index as u32,
                        begin: progress.requested() as u32,
                        length: block_size as u32,
                    }
                    .write(&mut session.stream)
                    .await?;
                    progress.note_requested(block_size);
                }
            }

            let message = timeout(PIECE_TIMEOUT, Message::read(&mut session.stream))
                .await
                .map_err(|_| PeerError::PieceTimeout)??;

            match message {
                Message::KeepAlive => {}
                Message::Unchoke => session.choked = false,
                Message::Choke => session.choked = true,
                Message::Have(index) => {
                    session
                        .bitfield
                        .get_or_insert_with(Bitfield::default)
                        .set_piece(index as usize);
                }
                Message::Bitfield(bits) => session.bitfield = Some(Bitfield::new(bits)),
                Message::Piece { index, begin, block } => {
                    if index as usize == work.index {
                        progress.add_block(begin as usize, &block)?;
                    }
                }
                // NotInterested, Request, Cancel, Port, extensions: not
                // acted on by a download-only client.
                _ => {}
            }
        }

        progress.verify(&work.hash)?;
        Ok(progress.into_buffer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    const TEST_PIECE_LENGTH: usize = 16384;

    fn test_content(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    fn piece_hashes(content: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
        content
            .chunks(piece_length)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect()
    }

    fn test_torrent(path: String, content: &[u8], peers: Vec<Peer>) -> Arc<Torrent> {
        let hashes = piece_hashes(content, TEST_PIECE_LENGTH);
        Arc::new(Torrent {
            name: path,
            info_hash: [0x5a; 20],
            peer_id: *b"-RT0001-aaaaaaaaaaaa",
            piece_hashes: hashes.clone(),
            piece_length: TEST_PIECE_LENGTH,
            total_length: content.len(),
            peers,
            state: Mutex::new(DownloadState {
                bytes_downloaded: 0,
                pieces_done: Bitfield::with_pieces(hashes.len()),
            }),
        })
    }

    /// A cooperative single-connection seeder: handshake, bitfield,
    /// unchoke on interest, then serve every request from `content`.
    /// `corrupt` makes it serve zeroed blocks instead.
    async fn run_seeder(listener: TcpListener, info_hash: [u8; 20], content: Vec<u8>, corrupt: bool) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let theirs = Handshake::read(&mut stream).await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        let ours = Handshake::new(info_hash, *b"-RT0001-bbbbbbbbbbbb");
        stream.write_all(&ours.serialize()).await.unwrap();

        let mut bitfield = Bitfield::with_pieces(content.len().div_ceil(TEST_PIECE_LENGTH));
        for index in 0..content.len().div_ceil(TEST_PIECE_LENGTH) {
            bitfield.set_piece(index);
        }
        Message::Bitfield(bitfield.as_bytes().to_vec())
            .write(&mut stream)
            .await
            .unwrap();

        loop {
            match Message::read(&mut stream).await {
                Ok(Message::Interested) => {
                    Message::Unchoke.write(&mut stream).await.unwrap();
                }
                Ok(Message::Request { index, begin, length }) => {
                    let start = index as usize * TEST_PIECE_LENGTH + begin as usize;
                    let block = if corrupt {
                        vec![0u8; length as usize]
                    } else {
                        content[start..start + length as usize].to_vec()
                    };
                    Message::Piece { index, begin, block }
                        .write(&mut stream)
                        .await
                        .unwrap();
                }
                Ok(_) => {}
                Err(_) => return, // client hung up
            }
        }
    }

    #[test]
    fn piece_size_handles_short_final_piece() {
        let content = test_content(20000);
        let torrent = test_torrent("unused".into(), &content, Vec::new());
        assert_eq!(torrent.num_pieces(), 2);
        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(1), 3616);
    }

    #[tokio::test]
    async fn downloads_from_a_cooperative_seeder() {
        let content = test_content(20000);
        let hashes = piece_hashes(&content, TEST_PIECE_LENGTH);
        let info_hash = [0x5a; 20];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(run_seeder(listener, info_hash, content.clone(), false));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload").to_str().unwrap().to_string();
        let peer = Peer { ip: Ipv4Addr::LOCALHOST, port };
        let torrent = test_torrent(path.clone(), &content, vec![peer]);
        assert_eq!(torrent.piece_hashes, hashes);

        Arc::clone(&torrent).download().await;

        assert!(torrent.is_complete());
        assert_eq!(torrent.bytes_downloaded(), 20000);
        assert_eq!(torrent.percent(), 100.0);
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn resume_pass_completes_without_peers() {
        let content = test_content(20000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done").to_str().unwrap().to_string();
        std::fs::write(&path, &content).unwrap();

        // No peers: only the resume pass can account for the bytes.
        let torrent = test_torrent(path, &content, Vec::new());
        Arc::clone(&torrent).download().await;

        assert!(torrent.is_complete());
        assert_eq!(torrent.percent(), 100.0);

        // Running again over the same state stays at 100, not above.
        Arc::clone(&torrent).download().await;
        assert_eq!(torrent.bytes_downloaded(), 20000);
    }

    #[tokio::test]
    async fn resume_pass_requeues_corrupt_pieces() {
        let content = test_content(20000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial").to_str().unwrap().to_string();

        // First piece valid on disk, second piece corrupted.
        let mut on_disk = content.clone();
        for byte in &mut on_disk[TEST_PIECE_LENGTH..] {
            *byte = !*byte;
        }
        std::fs::write(&path, &on_disk).unwrap();

        let torrent = test_torrent(path, &content, Vec::new());
        Arc::clone(&torrent).download().await;

        assert!(!torrent.is_complete());
        assert_eq!(torrent.pieces_done(), 1);
        assert_eq!(torrent.bytes_downloaded(), TEST_PIECE_LENGTH);
    }

    #[tokio::test]
    async fn corrupt_seeder_leaves_progress_untouched() {
        let content = test_content(20000);
        let info_hash = [0x5a; 20];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(run_seeder(listener, info_hash, content.clone(), true));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad").to_str().unwrap().to_string();
        let peer = Peer { ip: Ipv4Addr::LOCALHOST, port };
        let torrent = test_torrent(path.clone(), &content, vec![peer]);

        // The only session serves garbage: its first attempt fails the
        // hash check, the piece requeues, the worker exits, the download
        // stalls and returns.
        Arc::clone(&torrent).download().await;

        assert!(!torrent.is_complete());
        assert_eq!(torrent.bytes_downloaded(), 0);
        assert!(!std::path::Path::new(&path).exists());
    }
}
