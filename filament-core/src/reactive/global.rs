//! Process-scoped signals.
//!
//! A [`GlobalSignals`] table holds cells shared by every session in the
//! process. Sessions never read the table directly during a render: each
//! keeps a local mirror signal (see [`Runtime::global_signal`]) and the
//! table pushes new values into the mirrors through each session's re-entry
//! handle, so every session still observes them inside its own transaction.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::runtime::Runtime;
use super::signal::Value;
use crate::error::StoreError;
use crate::session::SessionHandle;

struct GlobalCell {
    value: Value,
    version: u64,
    type_id: TypeId,
    type_name: &'static str,
    /// Mirroring runtimes by runtime id.
    subscribers: HashMap<u64, SessionHandle>,
}

/// Table of process-wide cells.
#[derive(Default)]
pub struct GlobalSignals {
    cells: DashMap<String, GlobalCell>,
}

impl GlobalSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a cell.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.cells
            .get(key)
            .and_then(|cell| cell.value.downcast_ref::<T>().cloned())
    }

    /// Version of a cell; bumps on every accepted publish.
    pub fn version(&self, key: &str) -> Option<u64> {
        self.cells.get(key).map(|cell| cell.version)
    }

    /// Write a cell from outside any session and deliver it to every mirror.
    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) -> Result<usize, StoreError> {
        if let Some(cell) = self.cells.get(key) {
            if cell.type_id != TypeId::of::<T>() {
                return Err(StoreError::TypeMismatch {
                    what: format!("global `{key}`"),
                    expected: cell.type_name,
                    found: std::any::type_name::<T>(),
                });
            }
        }
        let value: Value = Arc::new(value);
        self.cells.entry(key.to_string()).or_insert_with(|| GlobalCell {
            value: value.clone(),
            version: 0,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            subscribers: HashMap::new(),
        });
        Ok(self.publish(key, value, None))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Value of `key`, initializing the cell on first use.
    pub(crate) fn get_or_init<T: Send + Sync + 'static>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<Value, StoreError> {
        let cell = self.cells.entry(key.to_string()).or_insert_with(|| GlobalCell {
            value: Arc::new(init()),
            version: 0,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            subscribers: HashMap::new(),
        });
        if cell.type_id != TypeId::of::<T>() {
            return Err(StoreError::TypeMismatch {
                what: format!("global `{key}`"),
                expected: cell.type_name,
                found: std::any::type_name::<T>(),
            });
        }
        Ok(cell.value.clone())
    }

    pub(crate) fn subscribe(&self, key: &str, runtime: u64, handle: SessionHandle) {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.subscribers.insert(runtime, handle);
        }
    }

    pub(crate) fn unsubscribe(&self, key: &str, runtime: u64) {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.subscribers.remove(&runtime);
        }
    }

    /// Store `value` and forward it to every mirror except `origin`.
    ///
    /// Publishing the value a cell already holds is a no-op, which is what
    /// stops a delivered value from bouncing back from the receiving session.
    pub(crate) fn publish(&self, key: &str, value: Value, origin: Option<u64>) -> usize {
        let Some(mut cell) = self.cells.get_mut(key) else {
            return 0;
        };
        if Arc::ptr_eq(&cell.value, &value) {
            return 0;
        }
        cell.value = value.clone();
        cell.version += 1;

        let mut delivered = 0;
        cell.subscribers.retain(|runtime, handle| {
            if Some(*runtime) == origin {
                return true;
            }
            let key = key.to_string();
            let value = value.clone();
            let sent = handle
                .enqueue(move |rt: &mut Runtime| {
                    rt.apply_global(&key, value)?;
                    Ok(())
                })
                .is_ok();
            if sent {
                delivered += 1;
            } else {
                trace!(runtime, "dropping closed global subscriber");
            }
            sent
        });
        delivered
    }
}

impl std::fmt::Debug for GlobalSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSignals")
            .field("cells", &self.cells.len())
            .finish()
    }
}
