//! Client events.
//!
//! An event record is `{kind: u8, target: varint handle, payload}`, where
//! the payload depends on the kind:
//!
//! | tag  | kind      | payload                                   |
//! |------|-----------|-------------------------------------------|
//! | 1    | click     | none                                      |
//! | 2    | input     | value string                              |
//! | 3    | change    | value string                              |
//! | 4    | submit    | field count, then name/value string pairs |
//! | 5    | key down  | key string, modifier bits                 |
//! | 6    | focus     | none                                      |
//! | 7    | blur      | none                                      |
//! | 0xFF | extension | subtype byte, length-prefixed bytes       |

use std::fmt;

use super::error::{DecodeError, EncodeError};
use super::reader::Reader;
use super::writer::Writer;
use crate::config::CodecLimits;
use crate::render::Handle;

/// Closed registry of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Click,
    Input,
    Change,
    Submit,
    KeyDown,
    Focus,
    Blur,
    Extension,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Click,
        EventKind::Input,
        EventKind::Change,
        EventKind::Submit,
        EventKind::KeyDown,
        EventKind::Focus,
        EventKind::Blur,
        EventKind::Extension,
    ];

    pub fn code(self) -> u8 {
        match self {
            EventKind::Click => 1,
            EventKind::Input => 2,
            EventKind::Change => 3,
            EventKind::Submit => 4,
            EventKind::KeyDown => 5,
            EventKind::Focus => 6,
            EventKind::Blur => 7,
            EventKind::Extension => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Click => "click",
            EventKind::Input => "input",
            EventKind::Change => "change",
            EventKind::Submit => "submit",
            EventKind::KeyDown => "keydown",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
            EventKind::Extension => "extension",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Modifier keys held during a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Modifiers(u8);

impl Modifiers {
    pub const SHIFT: Modifiers = Modifiers(1);
    pub const CTRL: Modifiers = Modifiers(1 << 1);
    pub const ALT: Modifiers = Modifiers(1 << 2);
    pub const META: Modifiers = Modifiers(1 << 3);

    const MASK: u8 = 0x0F;

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub fn contains(self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Self) -> Self {
        Modifiers(self.0 | rhs.0)
    }
}

/// Payload of a key-down event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInput {
    pub key: String,
    pub modifiers: Modifiers,
}

/// Submitted form fields, in document order.
pub type FormFields = Vec<(String, String)>;

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    Click,
    Input(String),
    Change(String),
    Submit(FormFields),
    KeyDown(KeyInput),
    Focus,
    Blur,
    Extension { subtype: u8, payload: Vec<u8> },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Click => EventKind::Click,
            EventData::Input(_) => EventKind::Input,
            EventData::Change(_) => EventKind::Change,
            EventData::Submit(_) => EventKind::Submit,
            EventData::KeyDown(_) => EventKind::KeyDown,
            EventData::Focus => EventKind::Focus,
            EventData::Blur => EventKind::Blur,
            EventData::Extension { .. } => EventKind::Extension,
        }
    }
}

/// One event from the renderer, aimed at a live node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub target: Handle,
    pub data: EventData,
}

impl Event {
    pub fn new(target: Handle, data: EventData) -> Self {
        Self { target, data }
    }

    pub fn click(target: Handle) -> Self {
        Self::new(target, EventData::Click)
    }

    pub fn input(target: Handle, value: impl Into<String>) -> Self {
        Self::new(target, EventData::Input(value.into()))
    }

    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

pub fn encode_event(event: &Event, limits: &CodecLimits) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new(limits);
    write_event(&mut w, event)?;
    Ok(w.into_inner())
}

pub(crate) fn write_event(w: &mut Writer<'_>, event: &Event) -> Result<(), EncodeError> {
    w.u8(event.kind().code());
    w.handle(event.target);
    match &event.data {
        EventData::Click | EventData::Focus | EventData::Blur => {}
        EventData::Input(value) | EventData::Change(value) => w.string("event value", value)?,
        EventData::Submit(fields) => {
            w.collection_len("form fields", fields.len())?;
            for (name, value) in fields {
                w.string("field name", name)?;
                w.string("field value", value)?;
            }
        }
        EventData::KeyDown(input) => {
            w.string("key", &input.key)?;
            w.u8(input.modifiers.bits());
        }
        EventData::Extension { subtype, payload } => {
            w.u8(*subtype);
            w.bytes("extension payload", payload)?;
        }
    }
    Ok(())
}

/// Decode exactly one event record.
pub fn decode_event(bytes: &[u8], limits: &CodecLimits) -> Result<Event, DecodeError> {
    let mut r = Reader::new(bytes, limits);
    let event = read_event(&mut r)?;
    r.finish()?;
    Ok(event)
}

pub(crate) fn read_event(r: &mut Reader<'_>) -> Result<Event, DecodeError> {
    let tag = r.u8()?;
    let kind = EventKind::from_code(tag).ok_or(DecodeError::UnknownTag { what: "event", tag })?;
    let target = r.handle()?;
    let data = match kind {
        EventKind::Click => EventData::Click,
        EventKind::Focus => EventData::Focus,
        EventKind::Blur => EventData::Blur,
        EventKind::Input => EventData::Input(r.string("event value")?),
        EventKind::Change => EventData::Change(r.string("event value")?),
        EventKind::Submit => {
            let len = r.collection_len("form fields")?;
            let mut fields = Vec::with_capacity(len);
            for _ in 0..len {
                let name = r.string("field name")?;
                let value = r.string("field value")?;
                fields.push((name, value));
            }
            EventData::Submit(fields)
        }
        EventKind::KeyDown => {
            let key = r.string("key")?;
            let modifiers = Modifiers::from_bits(r.u8()?);
            EventData::KeyDown(KeyInput { key, modifiers })
        }
        EventKind::Extension => {
            let subtype = r.u8()?;
            let payload = r.bytes("extension payload")?.to_vec();
            EventData::Extension { subtype, payload }
        }
    };
    Ok(Event { target, data })
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn click_record_layout() {
        let limits = CodecLimits::default();
        let bytes = encode_event(&Event::click(Handle::new(300)), &limits).unwrap();
        assert_eq!(bytes, vec![1, 0xAC, 0x02]);
        assert_eq!(decode_event(&bytes, &limits).unwrap(), Event::click(Handle::new(300)));
    }

    #[test]
    fn submit_and_key_payloads_survive() {
        let limits = CodecLimits::default();
        let submit = Event::new(
            Handle::new(4),
            EventData::Submit(vec![("name".into(), "Ada".into()), ("role".into(), "".into())]),
        );
        let key = Event::new(
            Handle::new(5),
            EventData::KeyDown(KeyInput {
                key: "Enter".into(),
                modifiers: Modifiers::SHIFT | Modifiers::CTRL,
            }),
        );
        for event in [submit, key] {
            let bytes = encode_event(&event, &limits).unwrap();
            assert_eq!(decode_event(&bytes, &limits).unwrap(), event);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let limits = CodecLimits::default();
        assert_eq!(
            decode_event(&[9, 1], &limits),
            Err(DecodeError::UnknownTag { what: "event", tag: 9 })
        );
    }

    #[test]
    fn truncated_input_value_is_rejected() {
        let limits = CodecLimits::default();
        let mut bytes = encode_event(&Event::input(Handle::new(2), "hello"), &limits).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            decode_event(&bytes, &limits),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn oversized_form_is_rejected_before_reading_fields() {
        let limits = CodecLimits {
            max_collection_len: 2,
            ..CodecLimits::default()
        };
        let bytes = [4, 1, 0xFF, 0xFF, 0x03];
        assert!(matches!(
            decode_event(&bytes, &limits),
            Err(DecodeError::TooLong { what: "form fields", .. })
        ));
    }

    proptest! {
        #[test]
        fn decoding_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let limits = CodecLimits::default();
            let _ = decode_event(&bytes, &limits);
        }
    }
}
