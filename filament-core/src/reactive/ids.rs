//! Identifier types for the reactive system.
//!
//! Every cell in the store is addressed by a typed identifier wrapping a
//! [`SlotKey`]. Identifiers are cheap to copy and are the only thing closures
//! and handles ever hold; the values themselves stay inside the
//! [`Runtime`](super::Runtime).

use std::fmt;

use super::arena::SlotKey;

macro_rules! slot_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(SlotKey);

        impl $name {
            pub(crate) fn new(key: SlotKey) -> Self {
                Self(key)
            }

            pub(crate) fn key(&self) -> SlotKey {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{:?}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0.index())
            }
        }
    };
}

slot_id!(
    /// Identifies a signal cell.
    SignalId,
    "signal"
);
slot_id!(
    /// Identifies a memoized derivation.
    MemoId,
    "memo"
);
slot_id!(
    /// Identifies an effect.
    EffectId,
    "effect"
);
slot_id!(
    /// Identifies a mounted component instance.
    InstanceId,
    "instance"
);
slot_id!(
    /// Identifies a keyed async operation slot.
    AsyncId,
    "async"
);

/// Any participant of the dependency graph.
///
/// Signals are sources; memos are both dependents and sources; effects and
/// component render passes are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Signal(SignalId),
    Memo(MemoId),
    Effect(EffectId),
    Component(InstanceId),
}

impl NodeRef {
    /// True for nodes the commit pipeline has to run (effects and components).
    pub fn is_sink(&self) -> bool {
        matches!(self, NodeRef::Effect(_) | NodeRef::Component(_))
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Signal(id) => id.fmt(f),
            NodeRef::Memo(id) => id.fmt(f),
            NodeRef::Effect(id) => id.fmt(f),
            NodeRef::Component(id) => id.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::arena::Arena;

    #[test]
    fn ids_display_with_their_kind() {
        let mut arena = Arena::new();
        let key = arena.insert(());
        assert_eq!(SignalId::new(key).to_string(), "signal#0");
        assert_eq!(NodeRef::Effect(EffectId::new(key)).to_string(), "effect#0");
    }

    #[test]
    fn sinks_are_effects_and_components() {
        let mut arena = Arena::new();
        let key = arena.insert(());
        assert!(NodeRef::Effect(EffectId::new(key)).is_sink());
        assert!(NodeRef::Component(InstanceId::new(key)).is_sink());
        assert!(!NodeRef::Memo(MemoId::new(key)).is_sink());
        assert!(!NodeRef::Signal(SignalId::new(key)).is_sink());
    }
}
