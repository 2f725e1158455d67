use std::collections::HashMap;
use thiserror::Error;
pub mod decoder;

pub use decoder::Decoder;

/**
 * A decoded bencode value.
 *
 * Bencode is the encoding used by torrent files and tracker responses.
 * Four shapes exist on the wire:
 *
 * 1. ByteString(Vec<u8>):
 *    - "4:spam" becomes ByteString(b"spam")
 *    - stored as raw bytes; torrent byte strings are not guaranteed UTF-8
 *
 * 2. Integer(i64):
 *    - "i42e" becomes Integer(42)
 *
 * 3. List(Vec<Bvalue>):
 *    - "l4:spami42ee" becomes List([ByteString(b"spam"), Integer(42)])
 *
 * 4. Dict(HashMap<Vec<u8>, Bvalue>):
 *    - "d3:foo3:bare" becomes Dict({b"foo" => ByteString(b"bar")})
 *    - keys are byte strings; well-formed files sort them lexicographically
 */
#[derive(Debug, PartialEq, Clone)]
pub enum Bvalue {
    ByteString(Vec<u8>),
    Integer(i64),
    List(Vec<Bvalue>),
    Dict(HashMap<Vec<u8>, Bvalue>),
}

impl Bvalue {
    /// Borrows the byte string inside, if this value is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bvalue::ByteString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bvalue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bvalue]> {
        match self {
            Bvalue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<Vec<u8>, Bvalue>> {
        match self {
            Bvalue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Error type for bencode decoding.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEoi,

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("dictionary keys must be strings")]
    DictKeyNotString,

    #[error("value at offset {0} is not a dictionary")]
    NotADictionary(usize),

    #[error("invalid bencode: {0}")]
    InvalidFormat(String),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decodes a single bencode value from the front of `data`.
///
/// Returns the value together with the number of bytes it occupied, so a
/// caller can tell whether the input held exactly one value.
pub fn decode(data: &[u8]) -> BencodeResult<(Bvalue, usize)> {
    let mut dec = Decoder::new(data);
    let value = dec.decode()?;
    Ok((value, dec.pos()))
}
