//! Bounded reader over one record.

use super::error::DecodeError;
use super::varint::decode_varint;
use crate::config::CodecLimits;
use crate::render::Handle;

/// Cursor over a byte slice that checks every length against the remaining
/// input and the configured ceilings before materializing anything.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: &'a CodecLimits,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], limits: &'a CodecLimits) -> Self {
        Self {
            buf,
            pos: 0,
            limits,
            depth: 0,
        }
    }

    pub fn limits(&self) -> &'a CodecLimits {
        self.limits
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof {
            offset: self.pos,
            needed: 1,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn varint(&mut self) -> Result<u64, DecodeError> {
        let offset = self.pos;
        let (value, used) = decode_varint(&self.buf[self.pos..]).map_err(|err| match err {
            DecodeError::VarintOverflow { .. } => DecodeError::VarintOverflow { offset },
            DecodeError::UnexpectedEof { needed, .. } => DecodeError::UnexpectedEof {
                offset: self.buf.len(),
                needed,
            },
            other => other,
        })?;
        self.pos += used;
        Ok(value)
    }

    pub fn handle(&mut self) -> Result<Handle, DecodeError> {
        self.varint().map(Handle::new)
    }

    /// Length-prefixed bytes, at most `max_string_len` long.
    pub fn bytes(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()?;
        if len > self.limits.max_string_len as u64 {
            return Err(DecodeError::TooLong {
                what,
                len,
                limit: self.limits.max_string_len,
            });
        }
        let len = len as usize;
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let bytes = self.bytes(what)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8 { what })
    }

    /// Element count of a collection whose entries take at least one byte
    /// each, so a count larger than the remaining input is rejected up front.
    pub fn count(&mut self, what: &'static str, limit: usize) -> Result<usize, DecodeError> {
        let len = self.varint()?;
        if len > limit as u64 {
            return Err(DecodeError::TooLong { what, len, limit });
        }
        let len = len as usize;
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        Ok(len)
    }

    pub fn collection_len(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        self.count(what, self.limits.max_collection_len)
    }

    /// Enter one level of nesting.
    pub fn descend(&mut self) -> Result<(), DecodeError> {
        if self.depth >= self.limits.max_depth {
            return Err(DecodeError::TooDeep {
                limit: self.limits.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Fail if anything is left after the record.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(DecodeError::TrailingBytes { remaining }),
        }
    }
}

// ---- Tests ----
