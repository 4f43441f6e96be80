//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a tracked context (render/memo/effect),
//!    the runtime registers that context as a subscriber.
//!
//! 2. When a signal is written, the value is buffered in the active
//!    transaction and all subscribers are marked dirty.
//!
//! 3. The value becomes visible to everyone once the outermost transaction
//!    commits, at which point the signal's version advances.
//!
//! # Handles and Slots
//!
//! [`Signal<T>`] is a `Copy` handle: an id plus a type marker. The value
//! itself lives in a [`SignalSlot`] inside the runtime, stored as an
//! immutable `Arc`. Writers always hand over a fresh value; nothing is ever
//! mutated through an alias.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::ids::{InstanceId, SignalId};

/// Type-erased, immutable value stored in the runtime.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Where a signal lives and how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Allocated in a component's hook slot; disposed on unmount.
    Instance(InstanceId),
    /// Keyed in the session table; lives as long as the session.
    Session,
    /// Session-local mirror of a process-wide cell.
    Global,
}

/// A reactive signal holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = rt.create_signal(0);
///
/// rt.transaction("increment", |rt| {
///     let value = rt.get(count);
///     rt.set(count, value + 1)?;
///     Ok(())
/// })?;
/// ```
pub struct Signal<T> {
    id: SignalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Signal<T> {
    pub(crate) fn from_id(id: SignalId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SignalId {
        self.id
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Signal<T> {}

impl<T> std::hash::Hash for Signal<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Creation options for a signal.
#[derive(Debug, Clone, Default)]
pub struct SignalOptions {
    /// Stable key under which the value is persisted.
    pub persist_key: Option<String>,
    /// Excluded from durability even if it has a persistence key.
    pub transient: bool,
    /// Name used in diagnostics.
    pub label: Option<String>,
}

impl SignalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn persist(mut self, key: impl Into<String>) -> Self {
        self.persist_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Failure to move a persisted value in or out of its byte form.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persisted value for `{key}` has an unexpected type")]
    TypeMismatch { key: String },

    #[error("failed to encode persisted value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode persisted value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Monomorphized encode/decode pair for a persisted signal's value type.
#[derive(Clone, Copy)]
pub struct PersistCodec {
    encode: fn(&Value) -> Option<Result<Vec<u8>, rmp_serde::encode::Error>>,
    decode: fn(&[u8]) -> Result<Value, rmp_serde::decode::Error>,
}

impl PersistCodec {
    pub fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        fn encode<T: Serialize + 'static>(
            value: &Value,
        ) -> Option<Result<Vec<u8>, rmp_serde::encode::Error>> {
            value
                .downcast_ref::<T>()
                .map(|value| rmp_serde::to_vec_named(value))
        }

        fn decode<T: DeserializeOwned + Send + Sync + 'static>(
            bytes: &[u8],
        ) -> Result<Value, rmp_serde::decode::Error> {
            let value: T = rmp_serde::from_slice(bytes)?;
            Ok(Arc::new(value))
        }

        Self {
            encode: encode::<T>,
            decode: decode::<T>,
        }
    }

    pub fn encode(&self, key: &str, value: &Value) -> Result<Vec<u8>, PersistError> {
        match (self.encode)(value) {
            Some(result) => Ok(result?),
            None => Err(PersistError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value, PersistError> {
        Ok((self.decode)(bytes)?)
    }
}

impl fmt::Debug for PersistCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PersistCodec")
    }
}

/// Storage for one signal inside the runtime.
#[derive(Debug)]
pub struct SignalSlot {
    /// Last committed value.
    pub value: Value,
    /// Global version at which the value was last committed.
    pub version: u64,
    pub scope: Scope,
    pub transient: bool,
    pub persist_key: Option<String>,
    pub codec: Option<PersistCodec>,
    /// Key of the process-wide cell this slot mirrors.
    pub global_key: Option<String>,
    pub label: Option<String>,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl SignalSlot {
    pub fn new<T: Send + Sync + 'static>(value: T, scope: Scope, version: u64) -> Self {
        Self {
            value: Arc::new(value),
            version,
            scope,
            transient: false,
            persist_key: None,
            codec: None,
            global_key: None,
            label: None,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Persisted and not opted out of durability.
    pub fn is_durable(&self) -> bool {
        !self.transient && self.persist_key.is_some() && self.codec.is_some()
    }

    /// Human-readable name for diagnostics.
    pub fn describe(&self, id: SignalId) -> String {
        match &self.label {
            Some(label) => format!("{id} `{label}`"),
            None => id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::arena::Arena;

    #[test]
    fn handles_are_copy_and_compare_by_id() {
        let mut arena = Arena::new();
        let id = SignalId::new(arena.insert(()));
        let a: Signal<i32> = Signal::from_id(id);
        let b = a;
        assert_eq!(a, b);
        assert_eq!(a.id(), id);
    }

    #[test]
    fn persist_codec_round_trips_values() {
        let codec = PersistCodec::of::<Vec<String>>();
        let value: Value = Arc::new(vec!["a".to_string(), "b".to_string()]);

        let bytes = codec.encode("items", &value).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(
            decoded.downcast_ref::<Vec<String>>(),
            Some(&vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn persist_codec_rejects_wrong_type() {
        let codec = PersistCodec::of::<u32>();
        let value: Value = Arc::new("not a number");
        assert!(matches!(
            codec.encode("n", &value),
            Err(PersistError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn durability_requires_key_and_no_transient_flag() {
        let mut slot = SignalSlot::new(1u32, Scope::Session, 0);
        assert!(!slot.is_durable());

        slot.persist_key = Some("n".into());
        slot.codec = Some(PersistCodec::of::<u32>());
        assert!(slot.is_durable());

        slot.transient = true;
        assert!(!slot.is_durable());
    }
}
