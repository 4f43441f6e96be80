//! Wire Codec
//!
//! Everything the session exchanges with the thin renderer after the JSON
//! handshake is a length-framed binary record built from base-128 varints
//! and length-prefixed strings.
//!
//! # How Decoding Stays Total
//!
//! 1. Every read goes through a [`Reader`], which checks a length against
//!    both the configured ceiling and the bytes actually remaining before
//!    slicing or allocating.
//!
//! 2. Collection counts are bounded the same way, so a forged count cannot
//!    make the decoder reserve memory it will never fill.
//!
//! 3. Nested subtrees carry an explicit depth counter; recursion stops at
//!    `max_depth` with [`DecodeError::TooDeep`].
//!
//! 4. Unknown tags and invalid UTF-8 are typed errors. No decoding path
//!    indexes without a bounds check or panics.
//!
//! Encoding applies the same ceilings, so a producer that builds an
//! oversized value gets an [`EncodeError`] instead of a frame the other side
//! would reject.

mod error;
mod event;
mod frame;
mod handshake;
mod patch;
mod reader;
pub(crate) mod varint;
mod writer;

pub use error::{DecodeError, EncodeError};
pub use event::{decode_event, encode_event, Event, EventData, EventKind, FormFields, KeyInput, Modifiers};
pub use frame::{decode_frame, encode_frame, FrameDecoder};
pub use handshake::{parse_client_hello, ClientHello, HandshakeError, HelloReject, ServerHandshake, ServerHello};
pub use patch::{decode_patches, encode_patches};
pub use reader::Reader;
pub use varint::{decode_varint, encode_varint, varint_len, MAX_VARINT_LEN};
pub use writer::Writer;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;
