//! Counting fan-in.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::task::Poll;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::runtime::coroutine::{note_progress, suspend_until, CoroutineId};

pub const NEGATIVE_COUNTER: &str = "negative WaitGroup counter";
pub const REUSED_BEFORE_WAIT_RETURNED: &str = "WaitGroup is reused before previous Wait has returned";
pub const COUNTER_OVERFLOW: &str = "WaitGroup counter overflow";

#[derive(Default)]
struct WaitGroupState {
    counter: i64,
    waiting: bool,
    waiter: Option<CoroutineId>,
    released: bool,
}

/// Counter plus at most one blocked waiter. Waits until the counter reaches
/// zero; the counter can be raised again after a wait returns.
#[derive(Clone, Default)]
pub struct WaitGroup {
    state: Rc<RefCell<WaitGroupState>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the counter by `delta`.
    ///
    /// A result below zero or beyond `i64::MAX` is rejected and leaves the
    /// counter unchanged.
    pub fn add(&self, delta: i64) -> Result<(), WorkflowError> {
        let mut state = self.state.borrow_mut();
        let next = state
            .counter
            .checked_add(delta)
            .ok_or_else(|| WorkflowError::misuse(COUNTER_OVERFLOW))?;
        if next < 0 {
            return Err(WorkflowError::misuse(NEGATIVE_COUNTER));
        }
        state.counter = next;
        if next == 0 && state.waiting {
            state.released = true;
        }
        note_progress();
        Ok(())
    }

    pub fn done(&self) -> Result<(), WorkflowError> {
        self.add(-1)
    }

    pub fn counter(&self) -> i64 {
        self.state.borrow().counter
    }

    /// Block until the counter reaches zero.
    ///
    /// Only one wait may be outstanding at a time.
    pub async fn wait(&self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        {
            let mut state = self.state.borrow_mut();
            if state.counter == 0 {
                return Ok(());
            }
            if state.waiting {
                return Err(WorkflowError::misuse(REUSED_BEFORE_WAIT_RETURNED));
            }
            if ctx.is_canceled() {
                return Err(WorkflowError::Canceled);
            }
            state.waiting = true;
            state.waiter = ctx.current_coroutine();
            state.released = false;
        }
        let _waiting = WaitingGuard { group: self };
        suspend_until(
            || "blocked on WaitGroup.Wait".to_string(),
            || {
                let state = self.state.borrow();
                if state.released || state.counter == 0 {
                    return Poll::Ready(Ok(()));
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

/// Clears the waiter slot when a wait returns, is canceled or is reaped.
struct WaitingGuard<'a> {
    group: &'a WaitGroup,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.group.state.borrow_mut();
        state.waiting = false;
        state.waiter = None;
        state.released = false;
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("WaitGroup")
            .field("counter", &state.counter)
            .field("waiter", &state.waiter)
            .finish()
    }
}
