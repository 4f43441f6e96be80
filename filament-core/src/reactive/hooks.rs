//! Hook Slots
//!
//! Every component instance owns an ordered array of hook slots. A render
//! pass walks the array with a cursor that starts at zero: the first render
//! appends one slot per stateful primitive it allocates, later renders must
//! ask for exactly the same kinds and types in exactly the same order, and
//! get back the primitive created the first time.
//!
//! Allocation is an explicit "get or create slot `i`" against this array.
//! Any disagreement is a [`HookOrderError`], raised before the render can
//! use a value from the wrong slot.

use std::any::TypeId;
use std::fmt;

use thiserror::Error;

use super::ids::{AsyncId, EffectId, MemoId, SignalId};
use super::runtime::Runtime;

/// Kind of primitive a hook slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Signal,
    Memo,
    Effect,
    Async,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::Signal => "signal",
            HookKind::Memo => "memo",
            HookKind::Effect => "effect",
            HookKind::Async => "async resource",
        })
    }
}

/// One allocated primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSlot {
    Signal {
        id: SignalId,
        ty: TypeId,
        type_name: &'static str,
    },
    Memo {
        id: MemoId,
        ty: TypeId,
        type_name: &'static str,
    },
    Effect {
        id: EffectId,
    },
    Async {
        id: AsyncId,
        ty: TypeId,
        type_name: &'static str,
    },
}

impl HookSlot {
    pub fn kind(&self) -> HookKind {
        match self {
            HookSlot::Signal { .. } => HookKind::Signal,
            HookSlot::Memo { .. } => HookKind::Memo,
            HookSlot::Effect { .. } => HookKind::Effect,
            HookSlot::Async { .. } => HookKind::Async,
        }
    }

    fn type_info(&self) -> Option<(TypeId, &'static str)> {
        match self {
            HookSlot::Signal { ty, type_name, .. }
            | HookSlot::Memo { ty, type_name, .. }
            | HookSlot::Async { ty, type_name, .. } => Some((*ty, type_name)),
            HookSlot::Effect { .. } => None,
        }
    }
}

const CAUSE_REORDERED: &str = "a hook call is conditional or the call order changed between renders";
const CAUSE_ADDED: &str = "a hook runs inside a condition or loop that was skipped on the first render";
const CAUSE_SKIPPED: &str = "a hook was skipped by an early return, condition or shorter loop";

/// Hook allocation disagreed with the instance's first render.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookOrderError {
    #[error("hook slot {index} of `{component}` holds a {expected}, but this render asked for a {found}: {cause}")]
    KindMismatch {
        component: String,
        index: usize,
        expected: HookKind,
        found: HookKind,
        cause: &'static str,
    },

    #[error("hook slot {index} of `{component}` holds `{expected}`, but this render asked for `{found}`: {cause}")]
    TypeMismatch {
        component: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
        cause: &'static str,
    },

    #[error("`{component}` allocated {found} hook slots, but its first render allocated {expected} (first difference at slot {index}): {cause}")]
    CountMismatch {
        component: String,
        index: usize,
        expected: usize,
        found: usize,
        cause: &'static str,
    },
}

impl HookOrderError {
    /// The slot index the violation was detected at.
    pub fn index(&self) -> usize {
        match self {
            HookOrderError::KindMismatch { index, .. }
            | HookOrderError::TypeMismatch { index, .. }
            | HookOrderError::CountMismatch { index, .. } => *index,
        }
    }

    pub fn cause(&self) -> &'static str {
        match self {
            HookOrderError::KindMismatch { cause, .. }
            | HookOrderError::TypeMismatch { cause, .. }
            | HookOrderError::CountMismatch { cause, .. } => cause,
        }
    }
}

/// Ordered slot array plus cursor for one component instance.
#[derive(Debug)]
pub struct HookSlots {
    component: String,
    slots: Vec<HookSlot>,
    cursor: usize,
    mounted: bool,
}

impl HookSlots {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            slots: Vec::new(),
            cursor: 0,
            mounted: false,
        }
    }

    /// Reset the cursor at the start of a render pass.
    pub fn begin(&mut self) {
        self.cursor = 0;
    }

    /// Claim the next slot.
    ///
    /// Returns the existing slot on a mounted instance, or `None` when the
    /// caller must allocate a new primitive and [`push`](Self::push) it.
    pub fn next(
        &mut self,
        kind: HookKind,
        ty: Option<(TypeId, &'static str)>,
    ) -> Result<Option<HookSlot>, HookOrderError> {
        let index = self.cursor;

        let Some(existing) = self.slots.get(index).copied() else {
            if self.mounted {
                return Err(HookOrderError::CountMismatch {
                    component: self.component.clone(),
                    index,
                    expected: self.slots.len(),
                    found: index + 1,
                    cause: CAUSE_ADDED,
                });
            }
            return Ok(None);
        };

        if existing.kind() != kind {
            return Err(HookOrderError::KindMismatch {
                component: self.component.clone(),
                index,
                expected: existing.kind(),
                found: kind,
                cause: CAUSE_REORDERED,
            });
        }

        if let (Some((expected, expected_name)), Some((found, found_name))) = (existing.type_info(), ty) {
            if expected != found {
                return Err(HookOrderError::TypeMismatch {
                    component: self.component.clone(),
                    index,
                    expected: expected_name,
                    found: found_name,
                    cause: CAUSE_REORDERED,
                });
            }
        }

        self.cursor += 1;
        Ok(Some(existing))
    }

    /// Record a slot allocated during the first render.
    pub fn push(&mut self, slot: HookSlot) {
        debug_assert!(!self.mounted, "slots are only appended during the first render");
        self.slots.push(slot);
        self.cursor = self.slots.len();
    }

    /// Check the slot count at the end of a successful render pass.
    pub fn finish(&mut self) -> Result<(), HookOrderError> {
        if self.mounted && self.cursor != self.slots.len() {
            return Err(HookOrderError::CountMismatch {
                component: self.component.clone(),
                index: self.cursor,
                expected: self.slots.len(),
                found: self.cursor,
                cause: CAUSE_SKIPPED,
            });
        }
        self.mounted = true;
        Ok(())
    }

    /// Undo a failed first render. Returns the slots whose primitives must be
    /// disposed; a mounted instance keeps its slots.
    pub fn rollback(&mut self) -> Vec<HookSlot> {
        self.cursor = 0;
        if self.mounted {
            Vec::new()
        } else {
            std::mem::take(&mut self.slots)
        }
    }

    /// Remove every slot for teardown, last allocated first.
    pub fn drain(&mut self) -> Vec<HookSlot> {
        let mut slots = std::mem::take(&mut self.slots);
        slots.reverse();
        self.cursor = 0;
        slots
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[HookSlot] {
        &self.slots
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

impl Runtime {
    /// Dispose the primitive a hook slot holds.
    pub(crate) fn dispose_hook(&mut self, slot: HookSlot) {
        match slot {
            HookSlot::Signal { id, .. } => self.dispose_signal_id(id),
            HookSlot::Memo { id, .. } => self.dispose_memo_id(id),
            HookSlot::Effect { id } => self.dispose_effect_id(id),
            HookSlot::Async { id, .. } => self.dispose_async(id),
        }
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::arena::Arena;

    fn signal_slot(arena: &mut Arena<()>) -> HookSlot {
        HookSlot::Signal {
            id: SignalId::new(arena.insert(())),
            ty: TypeId::of::<i32>(),
            type_name: "i32",
        }
    }

    fn i32_ty() -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<i32>(), "i32"))
    }

    #[test]
    fn second_render_returns_same_slots() {
        let mut arena = Arena::new();
        let mut hooks = HookSlots::new("Counter");
        let first = signal_slot(&mut arena);

        hooks.begin();
        assert_eq!(hooks.next(HookKind::Signal, i32_ty()).unwrap(), None);
        hooks.push(first);
        hooks.finish().unwrap();

        hooks.begin();
        assert_eq!(hooks.next(HookKind::Signal, i32_ty()).unwrap(), Some(first));
        hooks.finish().unwrap();
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn kind_mismatch_names_the_slot() {
        let mut arena = Arena::new();
        let mut hooks = HookSlots::new("Counter");
        hooks.begin();
        hooks.next(HookKind::Signal, i32_ty()).unwrap();
        hooks.push(signal_slot(&mut arena));
        hooks.finish().unwrap();

        hooks.begin();
        let err = hooks.next(HookKind::Memo, i32_ty()).unwrap_err();
        assert_eq!(err.index(), 0);
        assert!(matches!(
            err,
            HookOrderError::KindMismatch {
                expected: HookKind::Signal,
                found: HookKind::Memo,
                ..
            }
        ));
    }

    #[test]
    fn type_mismatch_is_detected() {
        let mut arena = Arena::new();
        let mut hooks = HookSlots::new("Form");
        hooks.begin();
        hooks.next(HookKind::Signal, i32_ty()).unwrap();
        hooks.push(signal_slot(&mut arena));
        hooks.finish().unwrap();

        hooks.begin();
        let err = hooks
            .next(HookKind::Signal, Some((TypeId::of::<String>(), "String")))
            .unwrap_err();
        assert!(matches!(err, HookOrderError::TypeMismatch { index: 0, .. }));
    }

    #[test]
    fn extra_and_missing_slots_are_count_mismatches() {
        let mut arena = Arena::new();
        let mut hooks = HookSlots::new("List");
        hooks.begin();
        hooks.next(HookKind::Signal, i32_ty()).unwrap();
        hooks.push(signal_slot(&mut arena));
        hooks.finish().unwrap();

        hooks.begin();
        hooks.next(HookKind::Signal, i32_ty()).unwrap();
        let err = hooks.next(HookKind::Signal, i32_ty()).unwrap_err();
        assert!(matches!(
            err,
            HookOrderError::CountMismatch {
                index: 1,
                expected: 1,
                found: 2,
                ..
            }
        ));

        hooks.begin();
        let err = hooks.finish().unwrap_err();
        assert!(matches!(err, HookOrderError::CountMismatch { index: 0, .. }));
        assert_eq!(err.cause(), CAUSE_SKIPPED);
    }

    #[test]
    fn rollback_only_releases_first_render_slots() {
        let mut arena = Arena::new();
        let mut hooks = HookSlots::new("Panel");
        hooks.begin();
        hooks.push(signal_slot(&mut arena));
        assert_eq!(hooks.rollback().len(), 1);
        assert!(hooks.is_empty());

        hooks.begin();
        hooks.push(signal_slot(&mut arena));
        hooks.finish().unwrap();
        hooks.begin();
        assert!(hooks.rollback().is_empty());
        assert_eq!(hooks.len(), 1);
    }
}
