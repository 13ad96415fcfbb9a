//! Deterministic multi-way wait.
//!
//! Cases are registered in call order. `select` fires exactly one case and
//! returns its callback's result:
//!
//! 1. a case already matched by a counterpart (a receiver took a pending send
//!    offer, or a sender handed a value to a pending receive) wins;
//! 2. otherwise the lowest-index case that is ready right now;
//! 3. otherwise the default case, when present;
//! 4. otherwise offers are registered on every channel case and the caller
//!    blocks.
//!
//! All offers of one select share a single claim owner, so counterparts can
//! match at most one of them.

use std::rc::Rc;
use std::task::Poll;

use serde::de::DeserializeOwned;

use crate::channel::{
    Channel, Claim, ClaimGuard, ClaimOwner, Delivery, Payload, Put, RecvWaiter, SendWaiter, Take, SEND_ON_CLOSED,
};
use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::future::WorkflowFuture;
use crate::runtime::coroutine::suspend_until;

type Fired<'a, R> = Box<dyn FnOnce() -> R + 'a>;

trait SelectCase<'a, R> {
    /// Check readiness without blocking. Returns the callback to run.
    fn try_ready(&mut self) -> Result<Option<Fired<'a, R>>, WorkflowError>;

    /// The owner reported this case matched. `None` when the delivered payload
    /// was corrupted and the case must wait again.
    fn take_claimed(&mut self) -> Option<Fired<'a, R>>;

    /// Put an offer on the channel, once.
    fn register(&mut self, owner: &Rc<ClaimOwner>, index: usize);

    /// Forget the outstanding offer so the case can be evaluated and
    /// registered again under a new owner.
    fn withdraw(&mut self);

    fn describe(&self) -> String;
}

struct ReceiveCase<'a, T, F> {
    channel: Channel<T>,
    callback: Option<F>,
    waiter: Option<Rc<RecvWaiter>>,
    _lifetime: std::marker::PhantomData<&'a ()>,
}

impl<'a, T, F, R> SelectCase<'a, R> for ReceiveCase<'a, T, F>
where
    T: DeserializeOwned + 'static,
    F: FnOnce(Option<T>) -> R + 'a,
    R: 'a,
{
    fn try_ready(&mut self) -> Result<Option<Fired<'a, R>>, WorkflowError> {
        if self.waiter.is_some() {
            // A registered receive only fires through its claim.
            return Ok(None);
        }
        loop {
            match self.channel.core().try_take() {
                Take::Value(payload) => match payload.decode::<T>() {
                    Ok(value) => return Ok(self.fire(Some(value))),
                    Err(e) => self.channel.core().record_corrupted(&e),
                },
                Take::Closed => return Ok(self.fire(None)),
                Take::Empty => return Ok(None),
            }
        }
    }

    fn take_claimed(&mut self) -> Option<Fired<'a, R>> {
        let delivery = self.waiter.take()?.take_delivery()?;
        match delivery {
            Delivery::Value(payload) => match payload.decode::<T>() {
                Ok(value) => self.fire(Some(value)),
                Err(e) => {
                    self.channel.core().record_corrupted(&e);
                    None
                }
            },
            Delivery::Closed => self.fire(None),
        }
    }

    fn register(&mut self, owner: &Rc<ClaimOwner>, index: usize) {
        if self.waiter.is_some() {
            return;
        }
        let waiter = RecvWaiter::new(Claim::new(owner, index));
        self.channel.core().enqueue_receiver(waiter.clone());
        self.waiter = Some(waiter);
    }

    fn withdraw(&mut self) {
        self.waiter = None;
    }

    fn describe(&self) -> String {
        format!("{}.Receive", self.channel.name())
    }
}

impl<'a, T, F> ReceiveCase<'a, T, F> {
    fn fire<R: 'a>(&mut self, value: Option<T>) -> Option<Fired<'a, R>>
    where
        T: 'a,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        let callback = self.callback.take()?;
        Some(Box::new(move || callback(value)))
    }
}

struct SendCase<'a, T, F> {
    channel: Channel<T>,
    value: Option<T>,
    callback: Option<F>,
    offer: Option<Rc<SendWaiter>>,
    staged: Option<Payload>,
    _lifetime: std::marker::PhantomData<&'a ()>,
}

impl<'a, T, F, R> SelectCase<'a, R> for SendCase<'a, T, F>
where
    T: DeserializeOwned + 'static,
    F: FnOnce() -> R + 'a,
    R: 'a,
{
    fn try_ready(&mut self) -> Result<Option<Fired<'a, R>>, WorkflowError> {
        if self.offer.is_some() {
            // A channel closing under a pending offer never fires it.
            return Ok(None);
        }
        let payload = match (self.staged.take(), self.value.take()) {
            (Some(staged), _) => staged,
            (None, Some(value)) => Payload::native(value),
            (None, None) => return Ok(None),
        };
        if self.channel.is_closed() {
            return Err(WorkflowError::misuse(SEND_ON_CLOSED));
        }
        match self.channel.core().try_put(payload)? {
            Put::Sent => Ok(self.fire()),
            Put::Full(payload) => {
                self.staged = Some(payload);
                Ok(None)
            }
        }
    }

    fn take_claimed(&mut self) -> Option<Fired<'a, R>> {
        self.offer.take()?;
        self.fire()
    }

    fn register(&mut self, owner: &Rc<ClaimOwner>, index: usize) {
        if self.offer.is_some() {
            return;
        }
        let Some(payload) = self.staged.take() else {
            return;
        };
        let offer = SendWaiter::new(Claim::new(owner, index), payload);
        self.channel.core().enqueue_sender(offer.clone());
        self.offer = Some(offer);
    }

    fn withdraw(&mut self) {
        // An offer on a channel that closed meanwhile stays inert.
        if self.channel.is_closed() {
            return;
        }
        if let Some(offer) = self.offer.take() {
            self.staged = offer.withdraw();
        }
    }

    fn describe(&self) -> String {
        format!("{}.Send", self.channel.name())
    }
}

impl<'a, T, F> SendCase<'a, T, F> {
    fn fire<R: 'a>(&mut self) -> Option<Fired<'a, R>>
    where
        F: FnOnce() -> R + 'a,
    {
        let callback = self.callback.take()?;
        Some(Box::new(callback))
    }
}

struct FutureCase<T, F> {
    future: WorkflowFuture<T>,
    callback: Option<F>,
}

impl<'a, T, F, R> SelectCase<'a, R> for FutureCase<T, F>
where
    T: Clone + 'static,
    F: FnOnce(Result<T, WorkflowError>) -> R + 'a,
    R: 'a,
{
    fn try_ready(&mut self) -> Result<Option<Fired<'a, R>>, WorkflowError> {
        let Some(outcome) = self.future.try_get() else {
            return Ok(None);
        };
        Ok(self.callback.take().map(|callback| Box::new(move || callback(outcome)) as Fired<'a, R>))
    }

    fn take_claimed(&mut self) -> Option<Fired<'a, R>> {
        None
    }

    fn register(&mut self, _owner: &Rc<ClaimOwner>, _index: usize) {}

    fn withdraw(&mut self) {}

    fn describe(&self) -> String {
        "Future".to_string()
    }
}

/// Multi-way wait over channel sends, channel receives and futures.
///
/// ```rust,ignore
/// let mut selector = ctx.new_selector();
/// selector
///     .add_receive(&ch_a, |v: Option<String>| format!("a:{v:?}"))
///     .add_receive(&ch_b, |v: Option<String>| format!("b:{v:?}"));
/// let picked = selector.select(&ctx).await?;
/// ```
pub struct Selector<'a, R = ()> {
    cases: Vec<Box<dyn SelectCase<'a, R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
}

impl<'a, R: 'a> Default for Selector<'a, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R: 'a> Selector<'a, R> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    /// Fire when a value can be received from `channel`, or with `None` once
    /// it is closed and drained.
    pub fn add_receive<T, F>(&mut self, channel: &Channel<T>, callback: F) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            callback: Some(callback),
            waiter: None,
            _lifetime: std::marker::PhantomData,
        }));
        self
    }

    /// Fire when `value` has been accepted by `channel`.
    pub fn add_send<T, F>(&mut self, channel: &Channel<T>, value: T, callback: F) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        F: FnOnce() -> R + 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value: Some(value),
            callback: Some(callback),
            offer: None,
            staged: None,
            _lifetime: std::marker::PhantomData,
        }));
        self
    }

    /// Fire with the outcome once `future` settles.
    pub fn add_future<T, F>(&mut self, future: &WorkflowFuture<T>, callback: F) -> &mut Self
    where
        T: Clone + 'static,
        F: FnOnce(Result<T, WorkflowError>) -> R + 'a,
    {
        self.cases.push(Box::new(FutureCase {
            future: future.clone(),
            callback: Some(callback),
        }));
        self
    }

    /// Fire immediately when no other case is ready. A later call replaces an
    /// earlier default.
    pub fn add_default<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.default = Some(Box::new(callback));
        self
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Block until one case fires and return its callback's result.
    pub async fn select(mut self, ctx: &WorkflowContext) -> Result<R, WorkflowError> {
        let mut claims = ClaimGuard::new(ClaimOwner::new());
        let point = format!(
            "blocked on Selector [{}]",
            self.cases.iter().map(|c| c.describe()).collect::<Vec<_>>().join(", ")
        );
        let outcome = suspend_until(
            move || point.clone(),
            || loop {
                if let Some(index) = claims.owner().fired() {
                    match self.cases.get_mut(index).and_then(|case| case.take_claimed()) {
                        Some(fired) => return Poll::Ready(Ok(fired)),
                        None => {
                            // Corrupted payload. Counterparts may have skipped
                            // other offers while the owner was fired, so every
                            // offer is withdrawn and placed again.
                            claims = ClaimGuard::new(ClaimOwner::new());
                            for case in self.cases.iter_mut() {
                                case.withdraw();
                            }
                            continue;
                        }
                    }
                }
                if ctx.is_canceled() {
                    return Poll::Ready(Err(WorkflowError::Canceled));
                }
                for case in self.cases.iter_mut() {
                    match case.try_ready() {
                        Ok(Some(fired)) => return Poll::Ready(Ok(fired)),
                        Ok(None) => {}
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                }
                if let Some(default) = self.default.take() {
                    return Poll::Ready(Ok(default));
                }
                for (index, case) in self.cases.iter_mut().enumerate() {
                    case.register(claims.owner(), index);
                }
                return Poll::Pending;
            },
        )
        .await;
        drop(claims);
        outcome.map(|fired| fired())
    }
}

impl<R> std::fmt::Debug for Selector<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("cases", &self.cases.len())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}
