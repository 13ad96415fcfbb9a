//! Coroutine record, single-step resume with panic capture, and the
//! suspension helper every blocking primitive is built on.
//!
//! A coroutine is a boxed local future polled with a no-op waker. It never
//! yields except at a blocking primitive, and each primitive is written with
//! [`suspend_until`], which re-checks its condition on every resume. The
//! dispatcher decides when to resume by watching a progress counter that
//! every state change bumps.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;

use crate::cancel::CancellationScope;
use crate::context::WorkflowContext;
use crate::error::{PanicError, WorkflowError};
use crate::future::WorkflowFuture;

thread_local! {
    static PROGRESS: Cell<u64> = const { Cell::new(0) };
    static BLOCKED_ON: RefCell<Option<String>> = const { RefCell::new(None) };
    static CAPTURING_PANIC: Cell<bool> = const { Cell::new(false) };
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record that some primitive changed state.
///
/// The counter is per thread. Dispatchers sharing a thread may see each
/// other's progress, which only costs an extra pass.
pub(crate) fn note_progress() {
    PROGRESS.with(|p| p.set(p.get().wrapping_add(1)));
}

pub(crate) fn progress_mark() -> u64 {
    PROGRESS.with(Cell::get)
}

fn note_blocked(point: String) {
    BLOCKED_ON.with(|b| *b.borrow_mut() = Some(point));
}

fn take_blocked() -> Option<String> {
    BLOCKED_ON.with(|b| b.borrow_mut().take())
}

/// Future that re-evaluates `poll` each time its coroutine is resumed.
///
/// `point` describes the blocking point for stack dumps ("blocked on
/// chan-1.Receive") and is only rendered when the condition is not met.
pub(crate) fn suspend_until<'a, T: 'a>(
    point: impl Fn() -> String + 'a,
    mut poll: impl FnMut() -> Poll<T> + 'a,
) -> impl Future<Output = T> + 'a {
    futures::future::poll_fn(move |_| match poll() {
        Poll::Ready(value) => {
            note_progress();
            Poll::Ready(value)
        }
        Poll::Pending => {
            note_blocked(point());
            Poll::Pending
        }
    })
}

/// Sequence number assigned at spawn. The root is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(pub(crate) u64);

impl CoroutineId {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Runnable,
    Blocked,
    Completed,
    Panicked,
}

/// Result side of a spawned coroutine.
pub struct CoroutineHandle<T> {
    id: CoroutineId,
    name: String,
    result: WorkflowFuture<T>,
}

impl<T> Clone for CoroutineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T> CoroutineHandle<T> {
    pub(crate) fn new(id: CoroutineId, name: String, result: WorkflowFuture<T>) -> Self {
        Self { id, name, result }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the coroutine returned or panicked.
    pub fn is_finished(&self) -> bool {
        self.result.is_ready()
    }
}

impl<T: Clone + 'static> CoroutineHandle<T> {
    /// The coroutine's result, without blocking.
    pub fn result(&self) -> Option<Result<T, WorkflowError>> {
        self.result.try_get()
    }

    /// Block until the coroutine finishes. A panic arrives as
    /// [`WorkflowError::Panic`].
    pub async fn join(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        self.result.get(ctx).await
    }

    pub fn future(&self) -> WorkflowFuture<T> {
        self.result.clone()
    }
}

impl<T> fmt::Debug for CoroutineHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub(crate) type CoroutineBody = LocalBoxFuture<'static, ()>;
pub(crate) type PanicSink = Box<dyn FnOnce(WorkflowError)>;

/// Outcome of one resume.
pub(crate) enum Step {
    Blocked,
    Completed,
    Panicked(PanicError),
}

pub(crate) struct Coroutine {
    id: CoroutineId,
    name: String,
    state: CoroutineState,
    body: Option<CoroutineBody>,
    scope: CancellationScope,
    on_panic: Option<PanicSink>,
    blocked_on: Option<String>,
    started: bool,
}

impl Coroutine {
    pub(crate) fn new(
        id: CoroutineId,
        name: String,
        scope: CancellationScope,
        body: CoroutineBody,
        on_panic: PanicSink,
    ) -> Self {
        Self {
            id,
            name,
            state: CoroutineState::Runnable,
            body: Some(body),
            scope,
            on_panic: Some(on_panic),
            blocked_on: None,
            started: false,
        }
    }

    pub(crate) fn id(&self) -> CoroutineId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> CoroutineState {
        self.state
    }

    pub(crate) fn scope(&self) -> &CancellationScope {
        &self.scope
    }

    pub(crate) fn blocked_on(&self) -> Option<&str> {
        self.blocked_on.as_deref()
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, CoroutineState::Runnable | CoroutineState::Blocked)
    }

    /// Run the body until it blocks, completes or panics.
    pub(crate) fn resume(&mut self) -> Step {
        let Some(body) = self.body.as_mut() else {
            return Step::Completed;
        };
        if !self.started {
            self.started = true;
            note_progress();
        }
        install_panic_hook();
        take_blocked();

        let capturing = CAPTURING_PANIC.with(|c| c.replace(true));
        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        CAPTURING_PANIC.with(|c| c.set(capturing));

        match polled {
            Ok(Poll::Pending) => {
                self.state = CoroutineState::Blocked;
                self.blocked_on = take_blocked();
                Step::Blocked
            }
            Ok(Poll::Ready(())) => {
                self.state = CoroutineState::Completed;
                self.blocked_on = None;
                self.body = None;
                note_progress();
                Step::Completed
            }
            Err(payload) => {
                let message = payload_to_string(payload.as_ref());
                let stack = PANIC_STACK.with(|s| s.borrow_mut().take()).unwrap_or_default();
                self.state = CoroutineState::Panicked;
                self.blocked_on = None;
                let body = self.body.take();
                // Drop guards of a panicked body may panic again.
                let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(body)));
                let error = PanicError::new(message, stack);
                if let Some(sink) = self.on_panic.take() {
                    sink(WorkflowError::Panic(error.clone()));
                }
                note_progress();
                Step::Panicked(error)
            }
        }
    }

    /// Detach the suspended body of a live coroutine so the caller can drop
    /// it. Code past the blocking point never runs.
    pub(crate) fn reap(&mut self) -> Option<CoroutineBody> {
        if !self.is_live() {
            return None;
        }
        self.state = CoroutineState::Completed;
        self.on_panic = None;
        self.body.take()
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("blocked_on", &self.blocked_on)
            .finish()
    }
}

/// Route panics raised inside a coroutine to a per-thread stack slot instead
/// of the default stderr report; everything else goes to the previous hook.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING_PANIC.with(Cell::get) {
                let stack = Backtrace::force_capture().to_string();
                PANIC_STACK.with(|s| *s.borrow_mut() = Some(stack));
            } else {
                previous(info);
            }
        }));
    });
}

pub(crate) fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "coroutine panicked".to_string()
    }
}

/// Marks which coroutine currently runs. Entering while held means two
/// bodies would run at once.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    holder: Cell<Option<CoroutineId>>,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Gate {
    pub(crate) fn enter(&self, id: CoroutineId) -> Result<GateGuard<'_>, CoroutineId> {
        match self.holder.get() {
            Some(current) => Err(current),
            None => {
                self.holder.set(Some(id));
                Ok(GateGuard { gate: self })
            }
        }
    }

    pub(crate) fn holder(&self) -> Option<CoroutineId> {
        self.holder.get()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.holder.set(None);
    }
}
