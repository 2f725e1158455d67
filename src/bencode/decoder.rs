use super::{BencodeError, BencodeResult, Bvalue};
use std::collections::HashMap;

/// Single-pass recursive-descent decoder over a byte slice.
///
/// The decoder keeps an explicit cursor into the input, which is what makes
/// two things possible that a streaming reader cannot do:
///
/// - a caller can interleave its own walk of a dictionary with the decoder
///   (decode a key, look at it, then decode the value), and
/// - [`Decoder::decode_dict_with_span`] can hand back the exact input bytes
///   of a nested dictionary, sentinels included.
///
/// The second point is load-bearing for torrent parsing: the info-hash is
/// SHA-1 over the raw `info` dictionary bytes, so the span must be returned
/// bit-exact rather than re-encoded from the parsed value.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor offset into the input.
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEoi)
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// Decodes the next value at the cursor.
    pub fn decode(&mut self) -> BencodeResult<Bvalue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(Bvalue::ByteString),
            b'i' => self.decode_integer().map(Bvalue::Integer),
            b'l' => self.decode_list().map(Bvalue::List),
            b'd' => self.decode_dict().map(Bvalue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "unexpected byte 0x{:02x} at offset {}",
                other, self.pos
            ))),
        }
    }

    /// Consumes the `'d'` sentinel of a dictionary at the cursor, leaving
    /// the cursor on its first key.
    ///
    /// Together with [`Decoder::at_container_end`] and
    /// [`Decoder::decode_key`] this lets a caller walk a dictionary in
    /// declaration order, decoding each value itself (or capturing it with
    /// [`Decoder::decode_dict_with_span`]).
    pub fn begin_dict(&mut self) -> BencodeResult<()> {
        let start = self.pos;
        if self.advance()? != b'd' {
            return Err(BencodeError::NotADictionary(start));
        }
        Ok(())
    }

    /// True when the cursor sits on the `'e'` terminator of the container
    /// being walked.
    pub fn at_container_end(&self) -> BencodeResult<bool> {
        Ok(self.peek()? == b'e')
    }

    /// Decodes a dictionary key at the cursor.
    pub fn decode_key(&mut self) -> BencodeResult<Vec<u8>> {
        if !self.peek()?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }
        self.decode_string()
    }

    /// Decodes the dictionary starting at the cursor, returning both the
    /// parsed entries and the raw input slice it occupied, terminator
    /// included.
    ///
    /// Fails with [`BencodeError::NotADictionary`] if the cursor is not on a
    /// `'d'` sentinel.
    pub fn decode_dict_with_span(
        &mut self,
    ) -> BencodeResult<(HashMap<Vec<u8>, Bvalue>, &'a [u8])> {
        let start = self.pos;
        if self.peek()? != b'd' {
            return Err(BencodeError::NotADictionary(start));
        }
        let dict = self.decode_dict()?;
        Ok((dict, &self.data[start..self.pos]))
    }

    /// Reads `<len>:<bytes>`. The length prefix is plain ASCII digits; the
    /// body is copied verbatim.
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(BencodeError::InvalidStringLength);
        }
        if self.advance()? != b':' {
            return Err(BencodeError::InvalidStringLength);
        }
        let length: usize = std::str::from_utf8(&self.data[start..self.pos - 1])
            .map_err(|_| BencodeError::InvalidStringLength)?
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        if length > self.data.len() - self.pos {
            return Err(BencodeError::InvalidStringLength);
        }
        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    /// Reads `i<number>e`.
    ///
    /// Rejects leading zeros (except a lone `0`), `-0`, and an empty body,
    /// mirroring the canonical encoding rules.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        if self.advance()? != b'i' {
            return Err(BencodeError::InvalidInteger);
        }
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let body = &self.data[start..self.pos];
        self.pos += 1; // consume 'e'

        if body.is_empty() || body == b"-" {
            return Err(BencodeError::InvalidInteger);
        }
        if body == b"-0" {
            return Err(BencodeError::InvalidInteger);
        }
        let digits = if body[0] == b'-' { &body[1..] } else { body };
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::InvalidInteger);
        }

        std::str::from_utf8(body)
            .map_err(|_| BencodeError::InvalidInteger)?
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    /// Reads `l<values>e`, recursing for each element.
    fn decode_list(&mut self) -> BencodeResult<Vec<Bvalue>> {
        if self.advance()? != b'l' {
            return Err(BencodeError::InvalidFormat("list must start with 'l'".into()));
        }
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode()?);
        }
        self.pos += 1; // consume 'e'
        Ok(list)
    }

    /// Reads `d(<key><value>)*e`. Keys must be byte strings; order is the
    /// order of appearance, and the decoder never reorders entries while
    /// scanning (only the final map loses ordering, which no caller that
    /// cares about spans relies on).
    fn decode_dict(&mut self) -> BencodeResult<HashMap<Vec<u8>, Bvalue>> {
        if self.advance()? != b'd' {
            return Err(BencodeError::InvalidFormat("dict must start with 'd'".into()));
        }
        let mut dict = HashMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::DictKeyNotString);
            }
            let key = self.decode_string()?;
            let value = self.decode()?;
            dict.insert(key, value);
        }
        self.pos += 1; // consume 'e'
        Ok(dict)
    }
}
