//! In-process host for driving workflows in tests.
//!
//! [`TestWorkflowEnvironment`] plays the part of the history and activity
//! machinery: it runs registered activity handlers as soon as they are
//! scheduled, fires timers and delayed callbacks on a logical clock, and stops
//! when the root finishes or nothing is left that could unblock it.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::runtime::dispatcher::{Dispatcher, DispatcherBuilder};
use crate::runtime::interceptor::WorkflowInterceptorFactory;
use crate::runtime::observability::{MetricsProvider, MetricsSnapshot};
use crate::runtime::{Command, DispatcherOptions, ExecutionStatus};

/// Host operations available to delayed callbacks.
pub trait HostControl {
    fn deliver_channel_value(&mut self, name: &str, value: Value) -> Result<(), WorkflowError>;
    fn close_channel(&mut self, name: &str);
    fn request_cancellation(&mut self);
    fn now_ms(&self) -> u64;
}

impl<O> HostControl for Dispatcher<O> {
    fn deliver_channel_value(&mut self, name: &str, value: Value) -> Result<(), WorkflowError> {
        Dispatcher::deliver_channel_value(self, name, value)
    }

    fn close_channel(&mut self, name: &str) {
        Dispatcher::close_channel(self, name)
    }

    fn request_cancellation(&mut self) {
        Dispatcher::request_cancellation(self)
    }

    fn now_ms(&self) -> u64 {
        Dispatcher::now_ms(self)
    }
}

type ActivityHandler = Box<dyn FnMut(Value) -> Result<Value, String>>;
type HostCallback = Box<dyn FnOnce(&mut dyn HostControl)>;

struct DelayedCallback {
    delay_ms: u64,
    seq: u64,
    callback: HostCallback,
}

/// Result of [`TestWorkflowEnvironment::execute_workflow`].
pub struct TestRun<O> {
    pub status: ExecutionStatus<O>,
    pub dispatcher: Dispatcher<O>,
}

impl<O> TestRun<O> {
    pub fn output(&self) -> Option<&O> {
        match &self.status {
            ExecutionStatus::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&WorkflowError> {
        match &self.status {
            ExecutionStatus::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// The root never finished and nothing pending could unblock it.
    pub fn is_stuck(&self) -> bool {
        matches!(self.status, ExecutionStatus::AwaitingExternalInput)
    }
}

pub struct TestWorkflowEnvironment {
    options: DispatcherOptions,
    metrics: Arc<MetricsProvider>,
    activities: BTreeMap<String, ActivityHandler>,
    callbacks: Vec<DelayedCallback>,
    factories: Vec<Rc<dyn WorkflowInterceptorFactory>>,
    executed_activities: Vec<String>,
    next_callback_seq: u64,
}

impl TestWorkflowEnvironment {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self::with_options(DispatcherOptions {
            workflow_type: workflow_type.into(),
            ..Default::default()
        })
    }

    pub fn with_options(options: DispatcherOptions) -> Self {
        Self {
            options,
            metrics: Arc::new(MetricsProvider::new()),
            activities: BTreeMap::new(),
            callbacks: Vec::new(),
            factories: Vec::new(),
            executed_activities: Vec::new(),
            next_callback_seq: 0,
        }
    }

    /// Handle `activity_type` synchronously with `handler`. `Err` becomes an
    /// application error on the workflow side.
    pub fn register_activity(
        &mut self,
        activity_type: impl Into<String>,
        handler: impl FnMut(Value) -> Result<Value, String> + 'static,
    ) -> &mut Self {
        self.activities.insert(activity_type.into(), Box::new(handler));
        self
    }

    /// Run `callback` once logical time reaches start + `delay_ms`.
    /// Callbacks due at the same instant run in registration order.
    pub fn register_delayed_callback(
        &mut self,
        delay_ms: u64,
        callback: impl FnOnce(&mut dyn HostControl) + 'static,
    ) -> &mut Self {
        self.callbacks.push(DelayedCallback {
            delay_ms,
            seq: self.next_callback_seq,
            callback: Box::new(callback),
        });
        self.next_callback_seq += 1;
        self
    }

    pub fn register_interceptor(&mut self, factory: Rc<dyn WorkflowInterceptorFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Activity types executed so far, in execution order.
    pub fn executed_activities(&self) -> &[String] {
        &self.executed_activities
    }

    /// Run `body` to completion, failure, or until it is stuck.
    pub fn execute_workflow<I, O, F, Fut>(&mut self, body: F, input: I) -> TestRun<O>
    where
        I: 'static,
        O: Clone + 'static,
        F: FnOnce(WorkflowContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        let mut builder = DispatcherBuilder::new(self.options.workflow_type.clone())
            .options(self.options.clone())
            .metrics(self.metrics.clone());
        for factory in &self.factories {
            builder = builder.interceptor(factory.clone());
        }
        let mut dispatcher = builder.spawn_root(body, input);

        let start = dispatcher.now_ms();
        let mut pending = std::mem::take(&mut self.callbacks);
        pending.sort_by_key(|c| (c.delay_ms, c.seq));
        let mut callbacks: VecDeque<(u64, HostCallback)> = pending
            .into_iter()
            .map(|c| (start.saturating_add(c.delay_ms), c.callback))
            .collect();

        // Callbacks due at the start run before the workflow body does.
        run_due_callbacks(&mut callbacks, start, &mut dispatcher);
        loop {
            let status = dispatcher.advance();
            if status.is_terminal() {
                return TestRun { status, dispatcher };
            }
            if self.run_commands(&mut dispatcher) {
                continue;
            }
            let next_callback = callbacks.front().map(|(due, _)| *due);
            match (next_callback, dispatcher.next_timer_deadline()) {
                (Some(due), None) => {
                    dispatcher.advance_logical_clock(due);
                    run_due_callbacks(&mut callbacks, due, &mut dispatcher);
                }
                (Some(due), Some(deadline)) if due <= deadline => {
                    dispatcher.advance_logical_clock(due);
                    run_due_callbacks(&mut callbacks, due, &mut dispatcher);
                }
                (_, Some(deadline)) => {
                    dispatcher.advance_logical_clock(deadline);
                }
                (None, None) => {
                    warn!(
                        workflow_type = %dispatcher.workflow_type(),
                        stack = %dispatcher.stack_trace(),
                        "workflow blocked with nothing pending"
                    );
                    return TestRun { status, dispatcher };
                }
            }
        }
    }

    /// Execute scheduled activities. Returns whether any result was delivered.
    fn run_commands<O>(&mut self, dispatcher: &mut Dispatcher<O>) -> bool {
        let mut delivered = false;
        for command in dispatcher.take_commands() {
            match command {
                Command::ScheduleActivity {
                    id,
                    activity_type,
                    input,
                } => {
                    let outcome = match self.activities.get_mut(&activity_type) {
                        Some(handler) => handler(input),
                        None => Err(format!("activity {activity_type} is not registered")),
                    };
                    self.executed_activities.push(activity_type.clone());
                    debug!(activity = %activity_type, id = id.0, ok = outcome.is_ok(), "executed activity");
                    if dispatcher.resolve_future(id, outcome).is_ok() {
                        delivered = true;
                    }
                }
                Command::StartTimer { id, fire_at_ms } => {
                    debug!(id = id.0, fire_at_ms, "timer started");
                }
                Command::RequestCancel { id } => {
                    debug!(id = id.0, "cancel requested");
                }
            }
        }
        delivered
    }
}

fn run_due_callbacks<O>(callbacks: &mut VecDeque<(u64, HostCallback)>, now_ms: u64, dispatcher: &mut Dispatcher<O>) {
    while callbacks.front().is_some_and(|(due, _)| *due <= now_ms) {
        if let Some((_, callback)) = callbacks.pop_front() {
            debug!(now_ms, "running delayed callback");
            callback(dispatcher);
        }
    }
}
