//! Codec error types.

use thiserror::Error;

/// Malformed or oversized input. Decoding never panics; every failure is one
/// of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}: {needed} more bytes needed")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("varint at offset {offset} does not fit in 64 bits")]
    VarintOverflow { offset: usize },

    #[error("{what} length {len} exceeds the limit of {limit}")]
    TooLong {
        what: &'static str,
        len: u64,
        limit: usize,
    },

    #[error("nesting deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("unknown {what} tag {tag:#04x}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("{what} is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },

    #[error("{remaining} unexpected trailing bytes")]
    TrailingBytes { remaining: usize },

    #[error("{what} record must target the root, not handle {target}")]
    UnexpectedTarget { what: &'static str, target: u64 },
}

/// A value the producer tried to send violates the codec ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{what} length {len} exceeds the limit of {limit}")]
    TooLong {
        what: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("nesting deeper than {limit} levels")]
    TooDeep { limit: usize },
}
