//! Off-Loop Work
//!
//! The session loop never blocks. Anything slow runs as a tokio task that
//! owns no session state and reports back through the [`SessionHandle`].
//!
//! # How Keyed Async Works
//!
//! 1. [`RenderCx::use_async`] claims an async hook slot and compares the key
//!    passed on this render with the key of the running operation.
//!
//! 2. A new key supersedes the old operation: its token is cancelled (which
//!    also abandons pending retries), the slot's version is bumped, and a
//!    new task is started, if the `keyed_async` budget allows it.
//!
//! 3. The task delivers its outcome as a callback carrying the version it
//!    was started with. The callback drops the outcome if the token was
//!    cancelled or the version is no longer current, so a superseded result
//!    is never applied.
//!
//! 4. Applied outcomes land in a signal the render read, so the instance
//!    re-renders with the new state.
//!
//! Every task token derives from the token of the computation that started
//! it, so unmounting an instance cancels all of its work.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::budget::{BudgetError, StormBudget};
use super::event_loop::SessionHandle;
use crate::error::{HandlerResult, StoreError};
use crate::reactive::{AsyncId, HookKind, HookSlot, InstanceId, Runtime, Scope, Signal, SignalId, SignalOptions};
use crate::render::{unexpected_slot, RenderCx, RenderError};

/// Budget category of keyed async starts.
pub const KEYED_ASYNC: &str = "keyed_async";
/// Budget category of [`Runtime::spawn`].
pub const SPAWN: &str = "spawn";
/// Budget category of [`Runtime::schedule_after`].
pub const TIMER: &str = "timer";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("no session loop is attached; off-loop work is unavailable")]
    Detached,

    #[error("no tokio runtime is available to run the task")]
    NoRuntime,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(err: impl fmt::Display) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// What a runtime needs to start work off its loop.
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    handle: SessionHandle,
    budget: Arc<StormBudget>,
}

impl TaskSpawner {
    pub fn new(handle: SessionHandle, budget: Arc<StormBudget>) -> Self {
        Self { handle, budget }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn budget(&self) -> &Arc<StormBudget> {
        &self.budget
    }

    /// Check everything a start needs, then charge `category`.
    fn admit(&self, category: &str) -> Result<tokio::runtime::Handle, TaskError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        self.budget.try_acquire(category)?;
        Ok(runtime)
    }
}

/// How often a failed keyed operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        backoff: Duration::ZERO,
    };

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// State of a keyed async operation as seen by a render.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncState<T> {
    Pending,
    Ready(T),
    Failed(TaskError),
}

impl<T> AsyncState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncState::Pending)
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            AsyncState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            AsyncState::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Runtime record of one keyed async hook.
pub struct AsyncSlot {
    pub(crate) owner: Option<InstanceId>,
    key: Option<Box<dyn Any + Send + Sync>>,
    key_type: &'static str,
    /// Bumped on every start; outcomes carry the version they belong to.
    version: u64,
    token: Option<CancellationToken>,
    /// Holds `(version, AsyncState<T>)` of the last applied outcome.
    state: SignalId,
    /// Why the start for the current version was refused.
    denied: Option<TaskError>,
}

impl AsyncSlot {
    fn key_matches<K: PartialEq + 'static>(&self, key: &K) -> bool {
        self.key
            .as_ref()
            .and_then(|current| current.downcast_ref::<K>())
            .is_some_and(|current| current == key)
    }
}

impl fmt::Debug for AsyncSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSlot")
            .field("owner", &self.owner)
            .field("key_type", &self.key_type)
            .field("version", &self.version)
            .field("running", &self.token.as_ref().is_some_and(|t| !t.is_cancelled()))
            .field("denied", &self.denied)
            .finish()
    }
}

type StateCell<T> = (u64, AsyncState<T>);

impl RenderCx<'_> {
    /// Keyed async resource owned by this instance.
    ///
    /// `fetch` runs off the loop whenever `key` differs from the previous
    /// render's key. Results of superseded keys are never applied.
    pub fn use_async<K, T, F, Fut>(&mut self, key: K, fetch: F) -> Result<AsyncState<T>, RenderError>
    where
        K: PartialEq + Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        self.use_async_with(key, RetryPolicy::NONE, fetch)
    }

    pub fn use_async_with<K, T, F, Fut>(
        &mut self,
        key: K,
        retry: RetryPolicy,
        fetch: F,
    ) -> Result<AsyncState<T>, RenderError>
    where
        K: PartialEq + Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let ty = (TypeId::of::<T>(), std::any::type_name::<T>());
        let id = match self.claim(HookKind::Async, Some(ty))? {
            Some(HookSlot::Async { id, .. }) => id,
            Some(other) => return Err(unexpected_slot(other)),
            None => {
                let owner = self.instance();
                let id = self.runtime().alloc_async::<K, T>(owner);
                self.record(HookSlot::Async {
                    id,
                    ty: ty.0,
                    type_name: ty.1,
                });
                id
            }
        };

        let rt = self.runtime();
        let superseded = rt.asyncs.get(id.key()).is_some_and(|slot| !slot.key_matches(&key));
        if superseded {
            rt.start_async(id, key, retry, fetch);
        }
        Ok(rt.async_state::<T>(id)?)
    }
}

impl Runtime {
    /// Handle of the loop that owns this runtime, once one is attached.
    pub fn session_handle(&self) -> Option<SessionHandle> {
        self.spawner.as_ref().map(|spawner| spawner.handle.clone())
    }

    /// Run `work` off the loop.
    ///
    /// The future is dropped as soon as the returned token (a child of the
    /// current computation's token) is cancelled. Results come back through
    /// the handle passed to `work`.
    pub fn spawn<F, Fut>(&mut self, work: F) -> Result<CancellationToken, TaskError>
    where
        F: FnOnce(SessionHandle, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let spawner = self.spawner.clone().ok_or(TaskError::Detached)?;
        let runtime = spawner.admit(SPAWN)?;
        let token = self.current_token().child_token();
        let task = work(spawner.handle.clone(), token.clone());
        let guard = token.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => trace!("spawned task cancelled"),
                _ = task => {}
            }
        });
        Ok(token)
    }

    /// Run `callback` on the loop after `delay`, in its own transaction.
    ///
    /// Cancelled with the computation that scheduled it.
    pub fn schedule_after<F>(&mut self, delay: Duration, callback: F) -> Result<CancellationToken, TaskError>
    where
        F: FnOnce(&mut Runtime) -> HandlerResult + Send + 'static,
    {
        let spawner = self.spawner.clone().ok_or(TaskError::Detached)?;
        let runtime = spawner.admit(TIMER)?;
        let token = self.current_token().child_token();
        let guard = token.clone();
        let handle = spawner.handle.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let sent = handle.enqueue_named("timer", move |rt| {
                if guard.is_cancelled() {
                    return Ok(());
                }
                callback(rt)
            });
            if sent.is_err() {
                trace!("timer fired after session closed");
            }
        });
        Ok(token)
    }

    fn alloc_async<K: 'static, T>(&mut self, owner: InstanceId) -> AsyncId
    where
        T: Clone + Send + Sync + 'static,
    {
        let state = self.alloc_signal::<StateCell<T>>(
            (0, AsyncState::Pending),
            Scope::Instance(owner),
            SignalOptions::new().transient().label("async state"),
            None,
        );
        AsyncId::new(self.asyncs.insert(AsyncSlot {
            owner: Some(owner),
            key: None,
            key_type: std::any::type_name::<K>(),
            version: 0,
            token: None,
            state: state.id(),
            denied: None,
        }))
    }

    fn start_async<K, T, F, Fut>(&mut self, id: AsyncId, key: K, retry: RetryPolicy, fetch: F)
    where
        K: PartialEq + Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let Some(slot) = self.asyncs.get_mut(id.key()) else {
            return;
        };
        if let Some(previous) = slot.token.take() {
            previous.cancel();
        }
        slot.version += 1;
        slot.key = Some(Box::new(key.clone()));
        slot.denied = None;
        let version = slot.version;
        let owner = slot.owner;

        let admitted = self
            .spawner
            .clone()
            .ok_or(TaskError::Detached)
            .and_then(|spawner| Ok((spawner.admit(KEYED_ASYNC)?, spawner.handle.clone())));
        let (runtime, handle) = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                debug!(async_id = %id, error = %err, "keyed async start refused");
                if let Some(slot) = self.asyncs.get_mut(id.key()) {
                    slot.denied = Some(err);
                }
                return;
            }
        };

        let token = self.token_for(owner).child_token();
        if let Some(slot) = self.asyncs.get_mut(id.key()) {
            slot.token = Some(token.clone());
        }
        debug!(async_id = %id, version, "keyed async started");
        runtime.spawn(run_keyed(id, version, key, retry, fetch, token, handle));
    }

    /// Apply an outcome delivered by a keyed task, unless it was superseded.
    fn complete_async<T>(
        &mut self,
        id: AsyncId,
        version: u64,
        token: &CancellationToken,
        outcome: AsyncState<T>,
    ) -> Result<(), StoreError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if token.is_cancelled() {
            trace!(async_id = %id, version, "dropping cancelled result");
            return Ok(());
        }
        let Some(slot) = self.asyncs.get(id.key()) else {
            trace!(async_id = %id, "dropping result of disposed operation");
            return Ok(());
        };
        if slot.version != version {
            trace!(async_id = %id, version, current = slot.version, "dropping stale result");
            return Ok(());
        }
        let state = slot.state;
        self.set(Signal::<StateCell<T>>::from_id(state), (version, outcome))
    }

    fn async_state<T>(&mut self, id: AsyncId) -> Result<AsyncState<T>, StoreError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(slot) = self.asyncs.get(id.key()) else {
            return Ok(AsyncState::Failed(TaskError::Cancelled));
        };
        if let Some(err) = &slot.denied {
            return Ok(AsyncState::Failed(err.clone()));
        }
        let version = slot.version;
        let state = Signal::<StateCell<T>>::from_id(slot.state);
        let (applied, outcome) = self.try_get(state)?;
        Ok(if applied == version { outcome } else { AsyncState::Pending })
    }

    pub(crate) fn dispose_async(&mut self, id: AsyncId) {
        let Some(slot) = self.asyncs.remove(id.key()) else {
            return;
        };
        if let Some(token) = slot.token {
            token.cancel();
        }
        self.dispose_signal_id(slot.state);
    }
}

async fn run_keyed<K, T, F, Fut>(
    id: AsyncId,
    version: u64,
    key: K,
    retry: RetryPolicy,
    fetch: F,
    token: CancellationToken,
    handle: SessionHandle,
) where
    K: Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
{
    let mut attempt = 1;
    let outcome = loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                trace!(async_id = %id, version, "keyed async cancelled");
                return;
            }
            result = fetch(key.clone()) => result,
        };
        match result {
            Ok(value) => break AsyncState::Ready(value),
            Err(err) if attempt < retry.max_attempts => {
                debug!(async_id = %id, attempt, error = %err, "retrying keyed async");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(retry.delay(attempt)) => {}
                }
                attempt += 1;
            }
            Err(err) => break AsyncState::Failed(err),
        }
    };

    let sent = handle.enqueue_named("async result", move |rt| {
        rt.complete_async(id, version, &token, outcome)?;
        Ok(())
    });
    if sent.is_err() {
        trace!(async_id = %id, "session closed before result arrived");
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::config::{BudgetConfig, RuntimeConfig};
    use crate::render::{component, el, ComponentView};
    use crate::session::{Session, SessionLoop};
    use crate::transport::MemorySink;

    type Seen = Arc<Mutex<Vec<AsyncState<String>>>>;

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn search(seen: Seen, gate: Arc<Notify>, calls: Arc<AtomicUsize>) -> ComponentView {
        component("search", move |cx| {
            let query = cx.session_signal("query", || "a".to_string())?;
            let key = cx.get(query);
            let gate = gate.clone();
            let calls = calls.clone();
            let state = cx.use_async(key, move |key: String| {
                let gate = gate.clone();
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if key == "a" {
                        gate.notified().await;
                    }
                    Ok(format!("result {key}"))
                }
            })?;
            seen.lock().push(state.clone());
            Ok(el("p").text(format!("{state:?}")).into())
        })
    }

    fn set_query(value: &'static str) -> impl FnOnce(&mut Runtime) -> HandlerResult + Send {
        move |rt| {
            let query = rt.session_signal("query", || "a".to_string())?;
            rt.set(query, value.to_string())?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn superseded_result_is_never_applied() {
        let seen: Seen = Arc::default();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let session = Session::new("async", &RuntimeConfig::default(), Box::new(MemorySink::new()));
        let (session_loop, handle) = SessionLoop::new(session, search(seen.clone(), gate.clone(), calls.clone()));
        let task = session_loop.spawn();

        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        handle.enqueue(set_query("b")).unwrap();
        wait_for(|| seen.lock().iter().any(|s| s.ready().is_some())).await;

        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close();
        task.await.unwrap();

        let seen = seen.lock();
        assert!(seen.iter().all(|s| s.ready().map_or(true, |v| v == "result b")));
        assert_eq!(seen.last(), Some(&AsyncState::Ready("result b".to_string())));
    }

    #[tokio::test]
    async fn second_start_in_window_is_refused() {
        let seen: Seen = Arc::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RuntimeConfig {
            budget: BudgetConfig {
                window_ms: 60_000,
                ..BudgetConfig::default()
            }
            .with_limit(KEYED_ASYNC, 1),
            ..RuntimeConfig::default()
        };
        let session = Session::new("budget", &config, Box::new(MemorySink::new()));
        let gate = Arc::new(Notify::new());
        let (session_loop, handle) = SessionLoop::new(session, search(seen.clone(), gate, calls.clone()));
        let task = session_loop.spawn();

        handle.enqueue(set_query("b")).unwrap();
        wait_for(|| seen.lock().iter().any(|s| s.error().is_some())).await;
        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        handle.close();
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let seen = seen.lock();
        assert!(matches!(
            seen.last(),
            Some(AsyncState::Failed(TaskError::Budget(BudgetError::Exceeded { limit: 1, .. })))
        ));
    }

    #[tokio::test]
    async fn failed_attempts_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen: Seen = Arc::default();
        let counter = attempts.clone();
        let record = seen.clone();
        let view = component("flaky", move |cx| {
            let counter = counter.clone();
            let state = cx.use_async_with(1u8, RetryPolicy::new(3, Duration::from_millis(1)), move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TaskError::failed("flaky"))
                    } else {
                        Ok("ok".to_string())
                    }
                }
            })?;
            record.lock().push(state);
            Ok(el("p").into())
        });
        let session = Session::new("retry", &RuntimeConfig::default(), Box::new(MemorySink::new()));
        let (session_loop, handle) = SessionLoop::new(session, view);
        let task = session_loop.spawn();

        wait_for(|| seen.lock().iter().any(|s| s.ready().is_some())).await;
        handle.close();
        task.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timers_fire_on_the_loop() {
        let session = Session::new("timer", &RuntimeConfig::default(), Box::new(MemorySink::new()));
        let view = component("ticker", |cx| {
            let ticks = cx.session_signal("ticks", || 0u32)?;
            let n = cx.get(ticks);
            Ok(el("p").text(n.to_string()).into())
        });
        let (session_loop, handle) = SessionLoop::new(session, view);
        let task = session_loop.spawn();

        handle
            .enqueue(|rt| {
                rt.schedule_after(Duration::from_millis(5), |rt| {
                    let ticks = rt.session_signal("ticks", || 0u32)?;
                    rt.update(ticks, |n| *n += 1)?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.close();

        let mut session = task.await.unwrap();
        let ticks = session.runtime_mut().session_signal("ticks", || 0u32).unwrap();
        assert_eq!(session.runtime_mut().peek(ticks), 1);
    }

    #[test]
    fn without_a_loop_async_work_is_refused() {
        let mut rt = Runtime::default();
        let err = rt.schedule_after(Duration::from_millis(1), |_| Ok(())).unwrap_err();
        assert_eq!(err, TaskError::Detached);
        assert!(rt.session_handle().is_none());
    }
}
