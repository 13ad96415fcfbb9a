//! Deterministic channels.
//!
//! A channel is rendezvous (capacity 0) or bounded. Blocked senders and
//! receivers wait in FIFO lists. Every waiter carries a [`Claim`] on its
//! owner: a plain send or receive owns its claim alone, a selector shares one
//! owner across all its cases, so at most one case of a selector is ever
//! matched by a counterpart.
//!
//! Values sent from workflow code travel as native boxed values; values
//! delivered by the host travel as JSON and are decoded on receipt. A payload
//! that does not decode to the channel's element type is dropped and counted,
//! and the receive carries on with the next value.

use std::any::{type_name, Any};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::runtime::coroutine::{note_progress, suspend_until};
use crate::runtime::observability::MetricsProvider;

/// Misuse message for sending on a closed channel.
pub const SEND_ON_CLOSED: &str = "send on closed channel";

pub(crate) enum Payload {
    Native(Box<dyn Any>),
    Encoded(Value),
}

impl Payload {
    pub(crate) fn native<T: 'static>(value: T) -> Self {
        Payload::Native(Box::new(value))
    }

    pub(crate) fn decode<T: DeserializeOwned + 'static>(self) -> Result<T, String> {
        match self {
            Payload::Native(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| format!("value is not a {}", type_name::<T>())),
            Payload::Encoded(value) => serde_json::from_value(value).map_err(|e| e.to_string()),
        }
    }
}

/// Shared by every waiter of one blocking operation. Fires at most once.
#[derive(Debug, Default)]
pub(crate) struct ClaimOwner {
    fired: Cell<Option<usize>>,
    retired: Cell<bool>,
}

impl ClaimOwner {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Index of the case a counterpart matched, if any.
    pub(crate) fn fired(&self) -> Option<usize> {
        self.fired.get()
    }

    /// The operation finished; its remaining waiters become inert.
    pub(crate) fn retire(&self) {
        self.retired.set(true);
    }
}

pub(crate) struct Claim {
    owner: Rc<ClaimOwner>,
    case: usize,
}

impl Claim {
    pub(crate) fn new(owner: &Rc<ClaimOwner>, case: usize) -> Self {
        Self {
            owner: owner.clone(),
            case,
        }
    }

    fn try_claim(&self) -> bool {
        if self.owner.retired.get() || self.owner.fired.get().is_some() {
            return false;
        }
        self.owner.fired.set(Some(self.case));
        true
    }
}

pub(crate) enum Delivery {
    Value(Payload),
    Closed,
}

pub(crate) struct RecvWaiter {
    claim: Claim,
    slot: RefCell<Option<Delivery>>,
}

impl RecvWaiter {
    pub(crate) fn new(claim: Claim) -> Rc<Self> {
        Rc::new(Self {
            claim,
            slot: RefCell::new(None),
        })
    }

    pub(crate) fn take_delivery(&self) -> Option<Delivery> {
        self.slot.borrow_mut().take()
    }
}

pub(crate) struct SendWaiter {
    claim: Claim,
    value: RefCell<Option<Payload>>,
}

impl SendWaiter {
    pub(crate) fn new(claim: Claim, payload: Payload) -> Rc<Self> {
        Rc::new(Self {
            claim,
            value: RefCell::new(Some(payload)),
        })
    }

    /// Take back a payload no receiver claimed.
    pub(crate) fn withdraw(&self) -> Option<Payload> {
        self.value.borrow_mut().take()
    }
}

pub(crate) enum Take {
    Value(Payload),
    Closed,
    Empty,
}

pub(crate) enum Put {
    Sent,
    Full(Payload),
}

struct ChannelState {
    buffer: VecDeque<Payload>,
    closed: bool,
    blocked_sends: VecDeque<Rc<SendWaiter>>,
    blocked_receives: VecDeque<Rc<RecvWaiter>>,
}

/// Untyped channel state shared by typed handles and the host.
pub(crate) struct ChannelCore {
    name: String,
    capacity: usize,
    state: RefCell<ChannelState>,
    metrics: Arc<MetricsProvider>,
}

impl ChannelCore {
    pub(crate) fn new(name: String, capacity: usize, metrics: Arc<MetricsProvider>) -> Rc<Self> {
        Rc::new(Self {
            name,
            capacity,
            state: RefCell::new(ChannelState {
                buffer: VecDeque::new(),
                closed: false,
                blocked_sends: VecDeque::new(),
                blocked_receives: VecDeque::new(),
            }),
            metrics,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Take one value without blocking.
    ///
    /// A buffered value wins; taking it lets the first live blocked sender
    /// refill the freed slot while the channel is open. An empty closed
    /// channel reports `Closed`. An empty open channel hands over directly
    /// from the first live sender.
    pub(crate) fn try_take(&self) -> Take {
        let mut state = self.state.borrow_mut();
        if let Some(payload) = state.buffer.pop_front() {
            while !state.closed {
                let Some(sender) = state.blocked_sends.pop_front() else {
                    break;
                };
                if sender.claim.try_claim() {
                    if let Some(refill) = sender.value.borrow_mut().take() {
                        state.buffer.push_back(refill);
                    }
                    break;
                }
            }
            note_progress();
            return Take::Value(payload);
        }
        if state.closed {
            return Take::Closed;
        }
        while let Some(sender) = state.blocked_sends.pop_front() {
            if sender.claim.try_claim() {
                if let Some(payload) = sender.value.borrow_mut().take() {
                    note_progress();
                    return Take::Value(payload);
                }
            }
        }
        Take::Empty
    }

    /// Place one value without blocking: first live blocked receiver, then
    /// free buffer space.
    pub(crate) fn try_put(&self, payload: Payload) -> Result<Put, WorkflowError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(WorkflowError::misuse(SEND_ON_CLOSED));
        }
        while let Some(receiver) = state.blocked_receives.pop_front() {
            if receiver.claim.try_claim() {
                *receiver.slot.borrow_mut() = Some(Delivery::Value(payload));
                note_progress();
                return Ok(Put::Sent);
            }
        }
        if state.buffer.len() < self.capacity {
            state.buffer.push_back(payload);
            note_progress();
            return Ok(Put::Sent);
        }
        Ok(Put::Full(payload))
    }

    pub(crate) fn enqueue_receiver(&self, waiter: Rc<RecvWaiter>) {
        self.state.borrow_mut().blocked_receives.push_back(waiter);
    }

    pub(crate) fn enqueue_sender(&self, waiter: Rc<SendWaiter>) {
        self.state.borrow_mut().blocked_sends.push_back(waiter);
    }

    /// Close the channel. Blocked receivers are told; blocked senders are
    /// dropped from the wait list unmatched, so their values are never queued.
    /// Idempotent.
    pub(crate) fn close(&self) {
        let receivers = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.blocked_sends.clear();
            std::mem::take(&mut state.blocked_receives)
        };
        for receiver in receivers {
            if receiver.claim.try_claim() {
                *receiver.slot.borrow_mut() = Some(Delivery::Closed);
            }
        }
        note_progress();
    }

    pub(crate) fn record_corrupted(&self, error: &str) {
        self.metrics.record_corrupted_signal();
        note_progress();
        warn!(channel = %self.name, error = %error, "dropping corrupted payload");
    }
}

/// Handle to a channel carrying values of type `T`.
pub struct Channel<T> {
    core: Rc<ChannelCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("capacity", &self.core.capacity)
            .field("len", &self.core.len())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

/// Retires its owner on drop, so the waiters of a finished, canceled or
/// reaped operation become inert.
pub(crate) struct ClaimGuard {
    owner: Rc<ClaimOwner>,
}

impl ClaimGuard {
    pub(crate) fn new(owner: Rc<ClaimOwner>) -> Self {
        Self { owner }
    }

    pub(crate) fn owner(&self) -> &Rc<ClaimOwner> {
        &self.owner
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.owner.retire();
    }
}

impl<T> Channel<T> {
    pub(crate) fn from_core(core: Rc<ChannelCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Rc<ChannelCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// 0 for a rendezvous channel.
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Close the channel. Buffered values stay receivable.
    pub fn close(&self) {
        self.core.close();
    }
}

impl<T: DeserializeOwned + 'static> Channel<T> {
    /// Send without blocking. `Ok(false)` when no receiver waits and the
    /// buffer is full; the value is dropped.
    pub fn send_async(&self, value: T) -> Result<bool, WorkflowError> {
        match self.core.try_put(Payload::native(value))? {
            Put::Sent => Ok(true),
            Put::Full(_) => Ok(false),
        }
    }

    /// Block until a receiver takes the value or a buffer slot frees up.
    ///
    /// Fails with a misuse error when the channel is closed, including while
    /// the sender is blocked.
    pub async fn send(&self, ctx: &WorkflowContext, value: T) -> Result<(), WorkflowError> {
        if ctx.is_canceled() {
            return Err(WorkflowError::Canceled);
        }
        let payload = match self.core.try_put(Payload::native(value))? {
            Put::Sent => return Ok(()),
            Put::Full(payload) => payload,
        };
        let owner = ClaimOwner::new();
        let _claim = ClaimGuard::new(owner.clone());
        self.core.enqueue_sender(SendWaiter::new(Claim::new(&owner, 0), payload));
        let name = self.core.name.clone();
        suspend_until(
            move || format!("blocked on {name}.Send"),
            || {
                if owner.fired().is_some() {
                    return Poll::Ready(Ok(()));
                }
                if self.core.is_closed() {
                    return Poll::Ready(Err(WorkflowError::misuse(SEND_ON_CLOSED)));
                }
                if ctx.is_canceled() {
                    return Poll::Ready(Err(WorkflowError::Canceled));
                }
                Poll::Pending
            },
        )
        .await
    }

    /// Receive without blocking. `None` when nothing is available.
    pub fn receive_async(&self) -> Option<T> {
        self.receive_async_with_more().0
    }

    /// Receive without blocking. The flag is false once the channel is closed
    /// and drained.
    pub fn receive_async_with_more(&self) -> (Option<T>, bool) {
        loop {
            match self.core.try_take() {
                Take::Value(payload) => match payload.decode::<T>() {
                    Ok(value) => return (Some(value), true),
                    Err(e) => self.core.record_corrupted(&e),
                },
                Take::Closed => return (None, false),
                Take::Empty => return (None, true),
            }
        }
    }

    /// Block until a value is available (`Some`) or the channel is closed and
    /// drained (`None`).
    ///
    /// A value already handed to this receiver is returned even when the
    /// scope was canceled in the meantime.
    pub async fn receive(&self, ctx: &WorkflowContext) -> Result<Option<T>, WorkflowError> {
        let mut pending: Option<(ClaimGuard, Rc<RecvWaiter>)> = None;
        let name = self.core.name.clone();
        suspend_until(
            move || format!("blocked on {name}.Receive"),
            move || loop {
                if let Some(delivery) = pending.as_ref().map(|(_, waiter)| waiter.take_delivery()) {
                    match delivery {
                        Some(Delivery::Value(payload)) => {
                            pending = None;
                            match payload.decode::<T>() {
                                Ok(value) => return Poll::Ready(Ok(Some(value))),
                                Err(e) => {
                                    self.core.record_corrupted(&e);
                                    continue;
                                }
                            }
                        }
                        Some(Delivery::Closed) => return Poll::Ready(Ok(None)),
                        None if ctx.is_canceled() => return Poll::Ready(Err(WorkflowError::Canceled)),
                        None => return Poll::Pending,
                    }
                }
                if ctx.is_canceled() {
                    return Poll::Ready(Err(WorkflowError::Canceled));
                }
                match self.core.try_take() {
                    Take::Value(payload) => match payload.decode::<T>() {
                        Ok(value) => return Poll::Ready(Ok(Some(value))),
                        Err(e) => self.core.record_corrupted(&e),
                    },
                    Take::Closed => return Poll::Ready(Ok(None)),
                    Take::Empty => {
                        let owner = ClaimOwner::new();
                        let waiter = RecvWaiter::new(Claim::new(&owner, 0));
                        self.core.enqueue_receiver(waiter.clone());
                        pending = Some((ClaimGuard::new(owner), waiter));
                        return Poll::Pending;
                    }
                }
            },
        )
        .await
    }
}
