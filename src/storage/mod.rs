//! Offset-indexed piece storage.
//!
//! One file per torrent, named by the torrent, holding the pieces at
//! their natural offsets (`index * piece_length`). The file is opened per
//! call, so every writer gets its own cursor and concurrent workers can
//! persist different pieces without coordinating. Writes past the current
//! end leave a sparse hole that later pieces fill in.
use std::io::SeekFrom;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Writes one piece at its offset, creating the file on first use.
pub async fn save_piece(
    path: &str,
    index: usize,
    piece_length: usize,
    data: &[u8],
) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start((index * piece_length) as u64))
        .await?;
    file.write_all(data).await?;
    Ok(())
}

/// Reads up to `piece_length` bytes at the piece's offset.
///
/// A short read is not an error: the final piece of a torrent ends before
/// a full `piece_length`, and the caller hashes whatever length it
/// expected. A missing file surfaces as the usual NotFound.
pub async fn read_piece(
    path: &str,
    index: usize,
    piece_length: usize,
) -> std::io::Result<Vec<u8>> {
    let mut file = OpenOptions::new().read(true).open(path).await?;
    file.seek(SeekFrom::Start((index * piece_length) as u64))
        .await?;

    let mut data = Vec::with_capacity(piece_length);
    file.take(piece_length as u64).read_to_end(&mut data).await?;
    Ok(data)
}
