//! Length framing.
//!
//! After the handshake every message is `{len: varint, body}`. The
//! [`FrameDecoder`] accepts bytes in arbitrary chunks and yields complete
//! bodies, rejecting a declared length above `max_frame_len` as soon as the
//! prefix has arrived.

use super::error::{DecodeError, EncodeError};
use super::varint::{decode_varint, encode_varint, varint_len};
use crate::config::CodecLimits;

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8], limits: &CodecLimits) -> Result<Vec<u8>, EncodeError> {
    if body.len() > limits.max_frame_len {
        return Err(EncodeError::TooLong {
            what: "frame",
            len: body.len(),
            limit: limits.max_frame_len,
        });
    }
    let mut out = Vec::with_capacity(varint_len(body.len() as u64) + body.len());
    encode_varint(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split exactly one frame out of `bytes`.
pub fn decode_frame<'a>(bytes: &'a [u8], limits: &CodecLimits) -> Result<&'a [u8], DecodeError> {
    let mut decoder = FrameDecoder::new(limits.max_frame_len);
    let (start, len) = decoder.header(bytes)?.ok_or(DecodeError::UnexpectedEof {
        offset: bytes.len(),
        needed: 1,
    })?;
    let end = start + len;
    if bytes.len() < end {
        return Err(DecodeError::UnexpectedEof {
            offset: bytes.len(),
            needed: end - bytes.len(),
        });
    }
    if bytes.len() > end {
        return Err(DecodeError::TrailingBytes {
            remaining: bytes.len() - end,
        });
    }
    Ok(&bytes[start..end])
}

/// Reassembles frames from a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, or `None` until more bytes arrive.
    ///
    /// An error leaves the stream unusable; the connection must resync.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let Some((start, len)) = self.header(&self.buf)? else {
            return Ok(None);
        };
        if self.buf.len() < start + len {
            return Ok(None);
        }
        let body = self.buf[start..start + len].to_vec();
        self.buf.drain(..start + len);
        Ok(Some(body))
    }

    /// Parse a length prefix: `(body offset, body length)`.
    fn header(&self, bytes: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
        match decode_varint(bytes) {
            Ok((len, used)) => {
                if len > self.max_frame_len as u64 {
                    return Err(DecodeError::TooLong {
                        what: "frame",
                        len,
                        limit: self.max_frame_len,
                    });
                }
                Ok(Some((used, len as usize)))
            }
            Err(DecodeError::UnexpectedEof { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

// ---- Tests ----
