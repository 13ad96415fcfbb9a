//! Settle-once result holders.
//!
//! [`WorkflowFuture`] is the read side, [`Settable`] the write side. Both are
//! cheap handles over the same cell. Waiting blocks the calling coroutine until
//! the cell settles or the caller's scope is canceled.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::runtime::coroutine::{note_progress, suspend_until};

/// Misuse message for a second settle.
pub const ALREADY_SETTLED: &str = "future already settled";

enum State<T> {
    Pending,
    Resolved(T),
    Rejected(WorkflowError),
}

type Continuation<T> = Box<dyn FnOnce(&Result<T, WorkflowError>)>;

struct FutureCell<T> {
    state: RefCell<State<T>>,
    continuations: RefCell<Vec<Continuation<T>>>,
}

impl<T> FutureCell<T> {
    fn is_settled(&self) -> bool {
        !matches!(*self.state.borrow(), State::Pending)
    }

    fn settle(&self, outcome: Result<T, WorkflowError>) -> Result<(), WorkflowError> {
        if self.is_settled() {
            return Err(WorkflowError::misuse(ALREADY_SETTLED));
        }
        let continuations = std::mem::take(&mut *self.continuations.borrow_mut());
        for continuation in continuations {
            continuation(&outcome);
        }
        *self.state.borrow_mut() = match outcome {
            Ok(value) => State::Resolved(value),
            Err(err) => State::Rejected(err),
        };
        note_progress();
        Ok(())
    }
}

/// Create a connected pair of read and write handles.
pub fn new_future<T>() -> (WorkflowFuture<T>, Settable<T>) {
    let cell = Rc::new(FutureCell {
        state: RefCell::new(State::Pending),
        continuations: RefCell::new(Vec::new()),
    });
    (WorkflowFuture { cell: cell.clone() }, Settable { cell })
}

/// Read side of a one-shot result.
pub struct WorkflowFuture<T> {
    cell: Rc<FutureCell<T>>,
}

impl<T> Clone for WorkflowFuture<T> {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

impl<T> WorkflowFuture<T> {
    /// A future that is already resolved.
    pub fn ready(value: T) -> Self {
        let (future, settable) = new_future();
        let _ = settable.set(value);
        future
    }

    /// A future that is already rejected.
    pub fn failed(error: WorkflowError) -> Self {
        let (future, settable) = new_future();
        let _ = settable.set_error(error);
        future
    }

    pub fn is_ready(&self) -> bool {
        self.cell.is_settled()
    }
}

impl<T: Clone + 'static> WorkflowFuture<T> {
    /// The outcome if settled, without blocking.
    pub fn try_get(&self) -> Option<Result<T, WorkflowError>> {
        match &*self.cell.state.borrow() {
            State::Pending => None,
            State::Resolved(value) => Some(Ok(value.clone())),
            State::Rejected(err) => Some(Err(err.clone())),
        }
    }

    /// Block until settled and return the value or the rejection.
    ///
    /// Returns `Canceled` without blocking, or on the next resume, once the
    /// caller's scope is canceled and the future is still pending.
    pub async fn get(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        suspend_until(
            || "blocked on Future.Get".to_string(),
            || {
                if let Some(outcome) = self.try_get() {
                    return Poll::Ready(outcome);
                }
                if ctx.is_canceled() {
                    return Poll::Ready(Err(WorkflowError::Canceled));
                }
                Poll::Pending
            },
        )
        .await
    }
}

impl WorkflowFuture<Value> {
    /// Wait for a JSON result and decode it.
    pub async fn get_decoded<R: DeserializeOwned>(&self, ctx: &WorkflowContext) -> Result<R, WorkflowError> {
        let value = self.get(ctx).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl<T> fmt::Debug for WorkflowFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowFuture").field("ready", &self.is_ready()).finish()
    }
}

/// Write side of a one-shot result. Settles at most once.
pub struct Settable<T> {
    cell: Rc<FutureCell<T>>,
}

impl<T> Clone for Settable<T> {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

impl<T> Settable<T> {
    pub fn set(&self, value: T) -> Result<(), WorkflowError> {
        self.cell.settle(Ok(value))
    }

    pub fn set_error(&self, error: WorkflowError) -> Result<(), WorkflowError> {
        self.cell.settle(Err(error))
    }

    pub fn settle(&self, outcome: Result<T, WorkflowError>) -> Result<(), WorkflowError> {
        self.cell.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        self.cell.is_settled()
    }

    /// The read side of this settable.
    pub fn future(&self) -> WorkflowFuture<T> {
        WorkflowFuture { cell: self.cell.clone() }
    }
}

impl<T: Clone + 'static> Settable<T> {
    /// Settle from `source` as soon as it settles.
    ///
    /// When this settable is settled in the meantime the chained outcome is
    /// dropped.
    pub fn chain(&self, source: &WorkflowFuture<T>) -> Result<(), WorkflowError> {
        if self.is_settled() {
            return Err(WorkflowError::misuse(ALREADY_SETTLED));
        }
        if let Some(outcome) = source.try_get() {
            return self.settle(outcome);
        }
        let target = self.clone();
        source.cell.continuations.borrow_mut().push(Box::new(move |outcome| {
            if !target.is_settled() {
                let _ = target.settle(outcome.clone());
            }
        }));
        Ok(())
    }
}

impl<T> fmt::Debug for Settable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settable").field("settled", &self.is_settled()).finish()
    }
}
