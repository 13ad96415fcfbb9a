//! Workflow-facing API and the per-execution state behind it.
//!
//! Every coroutine receives a [`WorkflowContext`]: a handle to the execution's
//! shared state plus the cancellation scope the coroutine runs under. All
//! primitives are created through it.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cancel::{CallbackKey, CancelHandle, CancellationScope};
use crate::channel::{Channel, ChannelCore};
use crate::error::WorkflowError;
use crate::future::{new_future, Settable, WorkflowFuture};
use crate::runtime::coroutine::{note_progress, Coroutine, CoroutineBody, CoroutineHandle, CoroutineId, Gate, PanicSink};
use crate::runtime::interceptor::{WorkflowInfo, WorkflowInterceptor};
use crate::runtime::observability::MetricsProvider;
use crate::runtime::{Command, DispatcherOptions, ExternalId};
use crate::selector::Selector;
use crate::wait_group::WaitGroup;

/// A pending external result, type-erased so the host can resolve it with JSON.
pub(crate) trait ExternalSlot {
    fn resolve(&self, outcome: Result<Value, String>);
    fn cancel(&self);
    fn is_settled(&self) -> bool;
}

struct DecodingSlot<T> {
    settable: Settable<T>,
}

impl<T: DeserializeOwned + 'static> ExternalSlot for DecodingSlot<T> {
    fn resolve(&self, outcome: Result<Value, String>) {
        let outcome = match outcome {
            Ok(value) => serde_json::from_value::<T>(value).map_err(WorkflowError::from),
            Err(message) => Err(WorkflowError::application(message)),
        };
        let _ = self.settable.settle(outcome);
    }

    fn cancel(&self) {
        let _ = self.settable.set_error(WorkflowError::Canceled);
    }

    fn is_settled(&self) -> bool {
        self.settable.is_settled()
    }
}

/// State shared by the dispatcher and every context of one execution.
pub(crate) struct Shared {
    pub(crate) options: DispatcherOptions,
    pub(crate) metrics: Arc<MetricsProvider>,
    pub(crate) gate: Gate,
    replaying: Cell<bool>,
    closing: Cell<bool>,
    now_ms: Cell<u64>,
    next_coroutine_seq: Cell<u64>,
    next_external_id: Cell<u64>,
    next_channel_seq: Cell<u64>,
    spawn_queue: RefCell<Vec<Coroutine>>,
    commands: RefCell<Vec<Command>>,
    externals: RefCell<BTreeMap<ExternalId, Box<dyn ExternalSlot>>>,
    timers: RefCell<BTreeSet<(u64, ExternalId)>>,
    cancel_hooks: RefCell<BTreeMap<ExternalId, (CancellationScope, CallbackKey)>>,
    signal_channels: RefCell<BTreeMap<String, Rc<ChannelCore>>>,
    interceptor: RefCell<Option<Rc<dyn WorkflowInterceptor>>>,
}

impl Shared {
    pub(crate) fn new(options: DispatcherOptions, metrics: Arc<MetricsProvider>) -> Rc<Self> {
        let now = options.start_time_ms;
        Rc::new(Self {
            options,
            metrics,
            gate: Gate::default(),
            replaying: Cell::new(false),
            closing: Cell::new(false),
            now_ms: Cell::new(now),
            next_coroutine_seq: Cell::new(0),
            next_external_id: Cell::new(1),
            next_channel_seq: Cell::new(1),
            spawn_queue: RefCell::new(Vec::new()),
            commands: RefCell::new(Vec::new()),
            externals: RefCell::new(BTreeMap::new()),
            timers: RefCell::new(BTreeSet::new()),
            cancel_hooks: RefCell::new(BTreeMap::new()),
            signal_channels: RefCell::new(BTreeMap::new()),
            interceptor: RefCell::new(None),
        })
    }

    pub(crate) fn workflow_info(&self) -> WorkflowInfo {
        WorkflowInfo {
            workflow_type: self.options.workflow_type.clone(),
        }
    }

    pub(crate) fn set_interceptor(&self, head: Rc<dyn WorkflowInterceptor>) {
        *self.interceptor.borrow_mut() = Some(head);
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying.get()
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.replaying.set(replaying);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.get()
    }

    pub(crate) fn set_closing(&self) {
        self.closing.set(true);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    /// Register a coroutine to run after every existing one.
    pub(crate) fn register_coroutine(
        &self,
        name: Option<String>,
        scope: CancellationScope,
        body: CoroutineBody,
        on_panic: PanicSink,
    ) -> (CoroutineId, String) {
        let id = CoroutineId(self.next_coroutine_seq.get());
        self.next_coroutine_seq.set(id.0 + 1);
        let name = name.unwrap_or_else(|| if id.0 == 0 { "root".to_string() } else { id.to_string() });
        self.spawn_queue
            .borrow_mut()
            .push(Coroutine::new(id, name.clone(), scope, body, on_panic));
        self.metrics.record_coroutine_spawned();
        note_progress();
        debug!(
            workflow_type = %self.options.workflow_type,
            coroutine_id = id.0,
            coroutine = %name,
            "spawned coroutine"
        );
        (id, name)
    }

    pub(crate) fn spawn<T, F, Fut>(
        self: &Rc<Self>,
        name: Option<String>,
        scope: CancellationScope,
        body: F,
    ) -> CoroutineHandle<T>
    where
        T: Clone + 'static,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + 'static,
    {
        let (future, settable) = new_future::<T>();
        let panic_sink = settable.clone();
        let work = body(WorkflowContext::new(self.clone(), scope.clone()));
        let wrapped: CoroutineBody = Box::pin(async move {
            let outcome = work.await;
            let _ = settable.settle(outcome);
        });
        let (id, name) = self.register_coroutine(
            name,
            scope,
            wrapped,
            Box::new(move |err| {
                let _ = panic_sink.set_error(err);
            }),
        );
        CoroutineHandle::new(id, name, future)
    }

    pub(crate) fn take_spawned(&self) -> Vec<Coroutine> {
        std::mem::take(&mut *self.spawn_queue.borrow_mut())
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.borrow_mut())
    }

    fn next_external_id(&self) -> ExternalId {
        let id = ExternalId(self.next_external_id.get());
        self.next_external_id.set(id.0 + 1);
        id
    }

    /// Create a future the host resolves later, bound to `scope`.
    ///
    /// Under an already-canceled scope the future is rejected at once and no
    /// command is issued.
    fn schedule_external<T>(
        self: &Rc<Self>,
        scope: &CancellationScope,
        command: impl FnOnce(ExternalId) -> Command,
    ) -> (Option<ExternalId>, WorkflowFuture<T>)
    where
        T: DeserializeOwned + 'static,
    {
        let (future, settable) = new_future::<T>();
        if scope.is_canceled() {
            let _ = settable.set_error(WorkflowError::Canceled);
            return (None, future);
        }
        let id = self.next_external_id();
        self.externals
            .borrow_mut()
            .insert(id, Box::new(DecodingSlot { settable }));
        self.commands.borrow_mut().push(command(id));
        let shared: Weak<Shared> = Rc::downgrade(self);
        let key = scope.on_cancel(move || {
            if let Some(shared) = shared.upgrade() {
                shared.cancel_external(id);
            }
        });
        self.cancel_hooks.borrow_mut().insert(id, (scope.clone(), key));
        (Some(id), future)
    }

    /// Unhook a settled external from its scope.
    fn release_cancel_hook(&self, id: ExternalId) {
        let hook = self.cancel_hooks.borrow_mut().remove(&id);
        if let Some((scope, key)) = hook {
            scope.remove_on_cancel(key);
        }
    }

    fn cancel_external(&self, id: ExternalId) {
        self.cancel_hooks.borrow_mut().remove(&id);
        let Some(slot) = self.externals.borrow_mut().remove(&id) else {
            return;
        };
        self.timers.borrow_mut().retain(|(_, timer)| *timer != id);
        if slot.is_settled() {
            return;
        }
        slot.cancel();
        if !self.is_closing() {
            self.commands.borrow_mut().push(Command::RequestCancel { id });
        }
    }

    pub(crate) fn resolve_external(&self, id: ExternalId, outcome: Result<Value, String>) -> Result<(), WorkflowError> {
        let slot = self
            .externals
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| WorkflowError::application(format!("unknown future id {id}")))?;
        self.timers.borrow_mut().retain(|(_, timer)| *timer != id);
        self.release_cancel_hook(id);
        slot.resolve(outcome);
        Ok(())
    }

    /// Move logical time forward, firing due timers in deadline order.
    pub(crate) fn advance_clock(&self, to_ms: u64) -> usize {
        if to_ms > self.now_ms.get() {
            self.now_ms.set(to_ms);
        }
        let now = self.now_ms.get();
        let mut fired = 0;
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.first().copied() {
                    Some(entry) if entry.0 <= now => {
                        timers.remove(&entry);
                        Some(entry.1)
                    }
                    _ => None,
                }
            };
            let Some(id) = due else {
                break;
            };
            let slot = self.externals.borrow_mut().remove(&id);
            if let Some(slot) = slot {
                self.release_cancel_hook(id);
                slot.resolve(Ok(Value::Null));
                fired += 1;
            }
        }
        fired
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.borrow().first().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn pending_externals(&self) -> usize {
        self.externals.borrow().len()
    }

    fn next_channel_name(&self) -> String {
        let seq = self.next_channel_seq.get();
        self.next_channel_seq.set(seq + 1);
        format!("chan-{seq}")
    }

    /// Get or create the named signal channel.
    pub(crate) fn signal_channel(&self, name: &str) -> Rc<ChannelCore> {
        self.signal_channels
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| {
                ChannelCore::new(name.to_string(), self.options.signal_channel_capacity, self.metrics.clone())
            })
            .clone()
    }

    pub(crate) fn existing_signal_channel(&self, name: &str) -> Option<Rc<ChannelCore>> {
        self.signal_channels.borrow().get(name).cloned()
    }

    /// Sorted names of signal channels holding undelivered values.
    pub(crate) fn unhandled_channel_names(&self) -> Vec<String> {
        self.signal_channels
            .borrow()
            .iter()
            .filter(|(_, core)| core.len() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop everything that could keep user values alive after close.
    pub(crate) fn clear(&self) {
        let spawned = self.take_spawned();
        drop(spawned);
        self.externals.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        let hooks = std::mem::take(&mut *self.cancel_hooks.borrow_mut());
        for (scope, key) in hooks.into_values() {
            scope.remove_on_cancel(key);
        }
        self.interceptor.borrow_mut().take();
    }
}

/// Handle given to workflow code for creating coroutines and primitives.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Rc<Shared>,
    scope: CancellationScope,
}

impl WorkflowContext {
    pub(crate) fn new(shared: Rc<Shared>, scope: CancellationScope) -> Self {
        Self { shared, scope }
    }

    pub fn workflow_type(&self) -> &str {
        &self.shared.options.workflow_type
    }

    pub fn info(&self) -> WorkflowInfo {
        self.shared.workflow_info()
    }

    /// Logical workflow time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.shared.now_ms()
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.is_replaying()
    }

    /// False while replaying; the `workflow_*!` macros check this.
    pub fn is_logging_enabled(&self) -> bool {
        !self.shared.is_replaying()
    }

    /// The coroutine currently running, if called from one.
    pub fn current_coroutine(&self) -> Option<CoroutineId> {
        self.shared.gate.holder()
    }

    pub fn scope(&self) -> &CancellationScope {
        &self.scope
    }

    pub fn is_canceled(&self) -> bool {
        self.scope.is_canceled()
    }

    /// Completes once this context's scope is canceled.
    pub async fn cancelled(&self) {
        self.scope.cancelled().await
    }

    /// Child context with its own cancellation scope.
    pub fn with_cancel(&self) -> (WorkflowContext, CancelHandle) {
        let (scope, handle) = CancellationScope::with_cancel(&self.scope);
        (WorkflowContext::new(self.shared.clone(), scope), handle)
    }

    /// Spawn a coroutine that runs after every existing one.
    pub fn go<T, F, Fut>(&self, body: F) -> CoroutineHandle<T>
    where
        T: Clone + 'static,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + 'static,
    {
        self.shared.spawn(None, self.scope.clone(), body)
    }

    pub fn go_named<T, F, Fut>(&self, name: impl Into<String>, body: F) -> CoroutineHandle<T>
    where
        T: Clone + 'static,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + 'static,
    {
        self.shared.spawn(Some(name.into()), self.scope.clone(), body)
    }

    /// Rendezvous channel.
    pub fn new_channel<T>(&self) -> Channel<T> {
        self.new_named_buffered_channel(self.shared.next_channel_name(), 0)
    }

    pub fn new_named_channel<T>(&self, name: impl Into<String>) -> Channel<T> {
        self.new_named_buffered_channel(name, 0)
    }

    pub fn new_buffered_channel<T>(&self, capacity: usize) -> Channel<T> {
        self.new_named_buffered_channel(self.shared.next_channel_name(), capacity)
    }

    pub fn new_named_buffered_channel<T>(&self, name: impl Into<String>, capacity: usize) -> Channel<T> {
        Channel::from_core(ChannelCore::new(name.into(), capacity, self.shared.metrics.clone()))
    }

    /// The named channel the host delivers signals to. Created on first use
    /// by either side.
    pub fn signal_channel<T>(&self, name: &str) -> Channel<T> {
        Channel::from_core(self.shared.signal_channel(name))
    }

    /// Sorted names of signal channels with undelivered values.
    pub fn unhandled_signal_names(&self) -> Vec<String> {
        self.shared.unhandled_channel_names()
    }

    pub fn new_future<T>(&self) -> (WorkflowFuture<T>, Settable<T>) {
        new_future()
    }

    pub fn new_wait_group(&self) -> WaitGroup {
        WaitGroup::new()
    }

    pub fn new_selector<'a, R: 'a>(&self) -> Selector<'a, R> {
        Selector::new()
    }

    /// Future resolved once logical time reaches now + `delay_ms`.
    ///
    /// A zero delay is ready immediately unless the scope is already
    /// canceled.
    pub fn new_timer(&self, delay_ms: u64) -> WorkflowFuture<()> {
        if self.scope.is_canceled() {
            return WorkflowFuture::failed(WorkflowError::Canceled);
        }
        if delay_ms == 0 {
            return WorkflowFuture::ready(());
        }
        let fire_at_ms = self.shared.now_ms().saturating_add(delay_ms);
        let (id, future) = self
            .shared
            .schedule_external::<()>(&self.scope, |id| Command::StartTimer { id, fire_at_ms });
        if let Some(id) = id {
            self.shared.timers.borrow_mut().insert((fire_at_ms, id));
        }
        future
    }

    /// Block for `delay_ms` of logical time. Fails with `Canceled` when the
    /// scope is canceled first.
    pub async fn sleep(&self, delay_ms: u64) -> Result<(), WorkflowError> {
        self.new_timer(delay_ms).get(self).await
    }

    /// Request an activity through the interceptor chain.
    pub fn execute_activity(&self, activity_type: &str, input: impl Serialize) -> WorkflowFuture<Value> {
        let input = match serde_json::to_value(input) {
            Ok(value) => value,
            Err(e) => return WorkflowFuture::failed(e.into()),
        };
        let head = self.shared.interceptor.borrow().clone();
        match head {
            Some(head) => head.execute_activity(self, activity_type, input),
            None => self.schedule_activity(activity_type, input),
        }
    }

    /// Issue the activity command, bypassing interceptors.
    pub(crate) fn schedule_activity(&self, activity_type: &str, input: Value) -> WorkflowFuture<Value> {
        let activity_type = activity_type.to_string();
        self.shared
            .schedule_external::<Value>(&self.scope, move |id| Command::ScheduleActivity {
                id,
                activity_type,
                input,
            })
            .1
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_type", &self.workflow_type())
            .field("now_ms", &self.now_ms())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
