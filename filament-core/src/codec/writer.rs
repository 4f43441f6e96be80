//! Size-checked writer.

use super::error::EncodeError;
use super::varint::encode_varint;
use crate::config::CodecLimits;
use crate::render::Handle;

/// Output buffer that refuses values the decoder on the other side would
/// reject.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: Vec<u8>,
    limits: &'a CodecLimits,
    depth: usize,
}

impl<'a> Writer<'a> {
    pub fn new(limits: &'a CodecLimits) -> Self {
        Self {
            buf: Vec::new(),
            limits,
            depth: 0,
        }
    }

    pub fn limits(&self) -> &'a CodecLimits {
        self.limits
    }

    pub fn u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn varint(&mut self, value: u64) {
        encode_varint(value, &mut self.buf);
    }

    pub fn handle(&mut self, handle: Handle) {
        self.varint(handle.get());
    }

    pub fn bytes(&mut self, what: &'static str, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() > self.limits.max_string_len {
            return Err(EncodeError::TooLong {
                what,
                len: bytes.len(),
                limit: self.limits.max_string_len,
            });
        }
        self.varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn string(&mut self, what: &'static str, text: &str) -> Result<(), EncodeError> {
        self.bytes(what, text.as_bytes())
    }

    pub fn count(&mut self, what: &'static str, len: usize, limit: usize) -> Result<(), EncodeError> {
        if len > limit {
            return Err(EncodeError::TooLong { what, len, limit });
        }
        self.varint(len as u64);
        Ok(())
    }

    pub fn collection_len(&mut self, what: &'static str, len: usize) -> Result<(), EncodeError> {
        self.count(what, len, self.limits.max_collection_len)
    }

    pub fn descend(&mut self) -> Result<(), EncodeError> {
        if self.depth >= self.limits.max_depth {
            return Err(EncodeError::TooDeep {
                limit: self.limits.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

// ---- Tests ----
