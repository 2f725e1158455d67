//! Torrent file parsing.
//!
//! A torrent file is a bencoded dictionary with an `announce` URL and an
//! `info` dictionary. The info dictionary's raw bytes identify the torrent
//! (its SHA-1 is the info-hash), so parsing walks the root with the cursor
//! decoder and captures the `info` span bit-exact instead of re-encoding
//! the parsed value, which could reorder keys and corrupt the hash.
use crate::bencode::{BencodeError, Bvalue, Decoder};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("torrent file is not a dictionary")]
    NotADict,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid data type for field: {0}")]
    InvalidFieldType(&'static str),

    #[error("field must be positive: {0}")]
    NonPositiveField(&'static str),

    #[error("pieces string length is not a multiple of 20")]
    InvalidPiecesLength,

    #[error("expected {expected} piece hashes, found {actual}")]
    PieceCountMismatch { expected: usize, actual: usize },
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;

/// Parsed torrent metadata. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMeta {
    /// Tracker announce URL.
    pub announce: String,
    /// Suggested file name.
    pub name: String,
    /// Bytes per piece (the final piece may be shorter).
    pub piece_length: usize,
    /// Total content length; for multi-file torrents, the sum over all
    /// file lengths, treated as one logical blob for piece math.
    pub total_length: usize,
    /// One 20-byte SHA-1 digest per piece, in piece order.
    pub piece_hashes: Vec<[u8; 20]>,
    /// The raw bencoded `info` dictionary, bit-exact as it appeared in
    /// the input.
    pub info_bytes: Vec<u8>,
    /// SHA-1 over `info_bytes`; the torrent's identity.
    pub info_hash: [u8; 20],
}

impl TorrentMeta {
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// Parses raw torrent file bytes into a [`TorrentMeta`].
#[tracing::instrument(skip(data), fields(len = data.len()), level = "debug")]
pub fn parse_torrent(data: &[u8]) -> MetainfoResult<TorrentMeta> {
    if data.first() != Some(&b'd') {
        return Err(MetainfoError::NotADict);
    }

    // Walk the root in declaration order so the info value can be
    // captured with its exact input span when its key comes up.
    let mut dec = Decoder::new(data);
    dec.begin_dict()?;

    let mut announce: Option<Vec<u8>> = None;
    let mut info: Option<(HashMap<Vec<u8>, Bvalue>, Vec<u8>)> = None;

    while !dec.at_container_end()? {
        let key = dec.decode_key()?;
        if key == b"info" {
            let (dict, span) = dec.decode_dict_with_span()?;
            info = Some((dict, span.to_vec()));
        } else {
            let value = dec.decode()?;
            if key == b"announce" {
                let url = value
                    .as_bytes()
                    .ok_or(MetainfoError::InvalidFieldType("announce"))?;
                announce = Some(url.to_vec());
            }
        }
    }

    let announce = announce.ok_or(MetainfoError::MissingField("announce"))?;
    let announce =
        String::from_utf8(announce).map_err(|_| MetainfoError::InvalidFieldType("announce"))?;
    let (info_dict, info_bytes) = info.ok_or(MetainfoError::MissingField("info"))?;

    let name = require_bytes(&info_dict, "name")?;
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| MetainfoError::InvalidFieldType("name"))?;

    let piece_length = require_positive(&info_dict, "piece length")?;
    let total_length = parse_total_length(&info_dict)?;
    let piece_hashes = parse_pieces(require_bytes(&info_dict, "pieces")?)?;

    let expected = total_length.div_ceil(piece_length);
    if piece_hashes.len() != expected {
        return Err(MetainfoError::PieceCountMismatch {
            expected,
            actual: piece_hashes.len(),
        });
    }

    let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();

    Ok(TorrentMeta {
        announce,
        name,
        piece_length,
        total_length,
        piece_hashes,
        info_bytes,
        info_hash,
    })
}

fn require_bytes<'d>(
    dict: &'d HashMap<Vec<u8>, Bvalue>,
    field: &'static str,
) -> MetainfoResult<&'d [u8]> {
    dict.get(field.as_bytes())
        .ok_or(MetainfoError::MissingField(field))?
        .as_bytes()
        .ok_or(MetainfoError::InvalidFieldType(field))
}

fn require_positive(
    dict: &HashMap<Vec<u8>, Bvalue>,
    field: &'static str,
) -> MetainfoResult<usize> {
    let n = dict
        .get(field.as_bytes())
        .ok_or(MetainfoError::MissingField(field))?
        .as_int()
        .ok_or(MetainfoError::InvalidFieldType(field))?;
    if n <= 0 {
        return Err(MetainfoError::NonPositiveField(field));
    }
    Ok(n as usize)
}

/// Total content length: `length` for single-file torrents, otherwise the
/// sum of `files[].length`.
fn parse_total_length(info: &HashMap<Vec<u8>, Bvalue>) -> MetainfoResult<usize> {
    if info.contains_key(b"length".as_slice()) {
        return require_positive(info, "length");
    }
    let files = info
        .get(b"files".as_slice())
        .ok_or(MetainfoError::MissingField("length"))?
        .as_list()
        .ok_or(MetainfoError::InvalidFieldType("files"))?;

    let mut total: usize = 0;
    for file in files {
        let dict = file
            .as_dict()
            .ok_or(MetainfoError::InvalidFieldType("files"))?;
        total += require_positive(dict, "length")?;
    }
    if total == 0 {
        return Err(MetainfoError::NonPositiveField("files"));
    }
    Ok(total)
}

/// Splits the concatenated `pieces` string into 20-byte SHA-1 digests.
///
/// The order is load-bearing: hash `i` verifies piece `i`.
fn parse_pieces(pieces: &[u8]) -> MetainfoResult<Vec<[u8; 20]>> {
    if pieces.len() % 20 != 0 {
        return Err(MetainfoError::InvalidPiecesLength);
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}
