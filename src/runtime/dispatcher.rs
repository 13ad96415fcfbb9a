//! The dispatcher: owns the coroutines of one execution and runs them until
//! none can make progress.
//!
//! Each `advance` makes full passes over the coroutines in spawn order. A pass
//! resumes every live coroutine once; coroutines spawned during a pass are
//! appended and resumed later in that same pass. Passes repeat while anything
//! changed state. Only one body runs at a time: the gate records the running
//! coroutine and rejects a second entry.
//!
//! When the root finishes, the remaining coroutines are stale. Their scopes are
//! canceled and their suspended bodies are dropped, which runs drop guards but
//! never the code past the blocking point.

use std::fmt::Write as _;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationScope;
use crate::channel::{Payload, Put};
use crate::context::{Shared, WorkflowContext};
use crate::error::WorkflowError;
use crate::future::new_future;
use crate::runtime::coroutine::{progress_mark, Coroutine, CoroutineBody, CoroutineHandle, CoroutineId, CoroutineState, Step};
use crate::runtime::interceptor::{build_chain, WorkflowBody, WorkflowInterceptorFactory};
use crate::runtime::observability::MetricsProvider;
use crate::runtime::{Command, DispatcherOptions, ExecutionStatus, ExternalId};

/// Collects options, metrics and interceptors, then spawns the root.
pub struct DispatcherBuilder {
    options: DispatcherOptions,
    metrics: Option<Arc<MetricsProvider>>,
    factories: Vec<Rc<dyn WorkflowInterceptorFactory>>,
}

impl DispatcherBuilder {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            options: DispatcherOptions {
                workflow_type: workflow_type.into(),
                ..Default::default()
            },
            metrics: None,
            factories: Vec::new(),
        }
    }

    /// Replace all options, including the workflow type.
    pub fn options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Report into a shared provider instead of a private one.
    pub fn metrics(mut self, metrics: Arc<MetricsProvider>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append an interceptor factory. Earlier factories wrap later ones.
    pub fn interceptor(mut self, factory: Rc<dyn WorkflowInterceptorFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Create the dispatcher with `body` as its root coroutine. Nothing runs
    /// until the first `advance`.
    pub fn spawn_root<I, O, F, Fut>(self, body: F, input: I) -> Dispatcher<O>
    where
        I: 'static,
        O: Clone + 'static,
        F: FnOnce(WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        let metrics = self.metrics.unwrap_or_default();
        let shared = Shared::new(self.options, metrics);
        let info = shared.workflow_info();
        let head = build_chain(&info, &self.factories);
        shared.set_interceptor(head.clone());

        let root_scope = CancellationScope::root();
        let ctx = WorkflowContext::new(shared.clone(), root_scope.clone());
        let (result, settable) = new_future::<O>();

        let output = settable.clone();
        let body_ctx = ctx.clone();
        let workflow: WorkflowBody = Box::pin(async move {
            let outcome = body(body_ctx, input).await;
            let forwarded = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
            let _ = output.settle(outcome);
            forwarded
        });
        let intercepted = head.execute_workflow(&ctx, &info.workflow_type, workflow);

        let root_result = settable.clone();
        let root_body: CoroutineBody = Box::pin(async move {
            let outcome = intercepted.await;
            if !root_result.is_settled() {
                // An interceptor finished without running the body.
                let _ = root_result.settle(match outcome {
                    Err(err) => Err(err),
                    Ok(()) => Err(WorkflowError::application("workflow finished without a result")),
                });
            }
        });
        let (id, name) = shared.register_coroutine(
            None,
            root_scope.clone(),
            root_body,
            Box::new(move |err| {
                let _ = settable.set_error(err);
            }),
        );

        info!(workflow_type = %info.workflow_type, "dispatcher created");
        Dispatcher {
            shared,
            coroutines: Vec::new(),
            root: CoroutineHandle::new(id, name, result),
            root_scope,
            trace: Vec::new(),
            closed: false,
        }
    }
}

/// Runs the coroutines of one execution attempt.
///
/// Single-threaded by construction (`!Send`). Dropping the dispatcher reaps
/// every coroutine still suspended.
pub struct Dispatcher<O> {
    shared: Rc<Shared>,
    coroutines: Vec<Coroutine>,
    root: CoroutineHandle<O>,
    root_scope: CancellationScope,
    trace: Vec<CoroutineId>,
    closed: bool,
}

impl<O: Clone + 'static> Dispatcher<O> {
    /// Run every coroutine that can make progress, in spawn order, until
    /// none can. Reaps stale coroutines once the root has finished.
    pub fn advance(&mut self) -> ExecutionStatus<O> {
        if self.closed {
            return self.status();
        }
        loop {
            let mark = progress_mark();
            self.run_pass();
            if progress_mark() == mark {
                break;
            }
        }
        let status = self.status();
        match &status {
            ExecutionStatus::Completed(_) => {
                self.shared.metrics.record_workflow_completion();
                info!(workflow_type = %self.shared.options.workflow_type, "workflow completed");
                self.close();
            }
            ExecutionStatus::Failed(err) => {
                self.shared.metrics.record_workflow_failure();
                error!(
                    workflow_type = %self.shared.options.workflow_type,
                    error_type = err.kind(),
                    error = %err,
                    "workflow failed"
                );
                self.close();
            }
            ExecutionStatus::AwaitingExternalInput => {
                debug!(
                    workflow_type = %self.shared.options.workflow_type,
                    live = self.coroutines.iter().filter(|c| c.is_live()).count(),
                    "all coroutines blocked"
                );
            }
        }
        status
    }

    /// Current outcome of the root coroutine.
    pub fn status(&self) -> ExecutionStatus<O> {
        match self.root.result() {
            Some(Ok(output)) => ExecutionStatus::Completed(output),
            Some(Err(err)) => ExecutionStatus::Failed(err),
            None => ExecutionStatus::AwaitingExternalInput,
        }
    }
}

impl<O> Dispatcher<O> {
    fn adopt_spawned(&mut self) {
        self.coroutines.extend(self.shared.take_spawned());
    }

    fn run_pass(&mut self) {
        self.adopt_spawned();
        let mut index = 0;
        while index < self.coroutines.len() {
            if self.coroutines[index].is_live() {
                self.resume_at(index);
                self.adopt_spawned();
            }
            index += 1;
        }
    }

    fn resume_at(&mut self, index: usize) {
        let coroutine = &mut self.coroutines[index];
        let id = coroutine.id();
        let _gate = match self.shared.gate.enter(id) {
            Ok(guard) => guard,
            Err(holder) => {
                error!(coroutine_id = id.0, holder = holder.0, "dispatcher gate already held");
                return;
            }
        };
        let mark = progress_mark();
        let step = coroutine.resume();
        if progress_mark() != mark {
            self.trace.push(id);
        }
        match step {
            Step::Blocked => {}
            Step::Completed => {
                debug!(coroutine_id = id.0, coroutine = %coroutine.name(), "coroutine completed");
            }
            Step::Panicked(err) => {
                self.shared.metrics.record_coroutine_panic();
                warn!(
                    coroutine_id = id.0,
                    coroutine = %coroutine.name(),
                    error = %err,
                    "coroutine panicked"
                );
            }
        }
    }

    /// Cancel and drop every live coroutine. Repeats while drop guards spawn
    /// new ones.
    fn reap_live(&mut self) {
        self.shared.set_closing();
        loop {
            self.adopt_spawned();
            let mut bodies = Vec::new();
            for coroutine in self.coroutines.iter_mut().filter(|c| c.is_live()) {
                coroutine.scope().cancel();
                if let Some(body) = coroutine.reap() {
                    bodies.push((coroutine.id(), coroutine.name().to_string(), body));
                }
            }
            if bodies.is_empty() {
                break;
            }
            for (id, name, body) in bodies {
                let _gate = self.shared.gate.enter(id).ok();
                if panic::catch_unwind(AssertUnwindSafe(move || drop(body))).is_err() {
                    warn!(coroutine_id = id.0, coroutine = %name, "panic while dropping stale coroutine");
                }
                self.shared.metrics.record_stale_coroutine_reaped();
                debug!(coroutine_id = id.0, coroutine = %name, "reaped stale coroutine");
            }
        }
    }

    /// Reap all coroutines and release external state. Idempotent; also run
    /// on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reap_live();
        self.closed = true;
        self.shared.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the root returned or panicked.
    pub fn is_complete(&self) -> bool {
        self.root.is_finished()
    }

    pub fn workflow_type(&self) -> &str {
        &self.shared.options.workflow_type
    }

    pub fn root_id(&self) -> CoroutineId {
        self.root.id()
    }

    /// Spawn a coroutine under the root scope from the host side.
    pub fn spawn<T, F, Fut>(&mut self, name: impl Into<String>, body: F) -> CoroutineHandle<T>
    where
        T: Clone + 'static,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>> + 'static,
    {
        self.shared.spawn(Some(name.into()), self.root_scope.clone(), body)
    }

    /// Settle the external future `id` with an activity or timer result.
    pub fn resolve_future(&mut self, id: ExternalId, outcome: Result<Value, String>) -> Result<(), WorkflowError> {
        self.shared.resolve_external(id, outcome)
    }

    /// Deliver a JSON value to the named signal channel, creating it on first
    /// use. Fails when the channel is closed or full.
    pub fn deliver_channel_value(&mut self, name: &str, value: Value) -> Result<(), WorkflowError> {
        let channel = self.shared.signal_channel(name);
        match channel.try_put(Payload::Encoded(value))? {
            Put::Sent => {
                debug!(channel = %name, "delivered signal");
                Ok(())
            }
            Put::Full(_) => Err(WorkflowError::application(format!("signal channel {name} is full"))),
        }
    }

    pub fn close_channel(&mut self, name: &str) {
        self.shared.signal_channel(name).close();
    }

    /// Move logical time to `to_ms` and fire due timers. Time never moves
    /// backwards. Returns the number of timers fired.
    pub fn advance_logical_clock(&mut self, to_ms: u64) -> usize {
        self.shared.advance_clock(to_ms)
    }

    /// Cancel the root scope, and with it every scope in the execution.
    pub fn request_cancellation(&mut self) {
        info!(workflow_type = %self.shared.options.workflow_type, "cancellation requested");
        self.root_scope.cancel();
    }

    /// Drain the commands issued since the last call.
    pub fn take_commands(&mut self) -> Vec<Command> {
        self.shared.take_commands()
    }

    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.shared.next_timer_deadline()
    }

    /// Number of activity and timer futures awaiting the host.
    pub fn pending_futures(&self) -> usize {
        self.shared.pending_externals()
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.now_ms()
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        self.shared.set_replaying(replaying);
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.is_replaying()
    }

    /// Sorted names of signal channels that still hold undelivered values.
    pub fn unhandled_channel_names(&self) -> Vec<String> {
        self.shared.unhandled_channel_names()
    }

    /// Coroutines that made progress, in resume order, over the whole
    /// execution. Identical for identical inputs.
    pub fn resumption_trace(&self) -> &[CoroutineId] {
        &self.trace
    }

    pub fn coroutine_states(&self) -> Vec<(CoroutineId, String, CoroutineState)> {
        self.coroutines
            .iter()
            .map(|c| (c.id(), c.name().to_string(), c.state()))
            .collect()
    }

    /// One line per live coroutine with its blocking point.
    pub fn stack_trace(&self) -> String {
        let mut out = String::new();
        for coroutine in self.coroutines.iter().filter(|c| c.is_live()) {
            let point = coroutine.blocked_on().unwrap_or("runnable");
            let _ = writeln!(out, "coroutine {} [{}]", coroutine.name(), point);
        }
        out
    }

    pub fn metrics(&self) -> &Arc<MetricsProvider> {
        &self.shared.metrics
    }
}

impl<O> Drop for Dispatcher<O> {
    fn drop(&mut self) {
        self.close();
    }
}
