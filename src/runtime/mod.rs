use std::fmt;

use serde_json::Value;

use crate::error::WorkflowError;

pub(crate) mod coroutine;
pub mod dispatcher;
pub mod interceptor;
pub mod observability;

pub use coroutine::{CoroutineHandle, CoroutineId, CoroutineState};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use interceptor::{WorkflowBody, WorkflowInfo, WorkflowInterceptor, WorkflowInterceptorFactory};
pub use observability::{init_logging, LogFormat, MetricsProvider, MetricsSnapshot, ObservabilityConfig};

/// Configuration options for a Dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Workflow type name, reported to interceptors and in log fields.
    /// Default: "workflow"
    pub workflow_type: String,
    /// Buffer capacity of named signal channels created on demand.
    /// Deliveries beyond this are rejected.
    /// Default: 100000
    pub signal_channel_capacity: usize,
    /// Logical time, in milliseconds, the execution starts at.
    /// Default: 0
    pub start_time_ms: u64,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workflow_type: "workflow".to_string(),
            signal_channel_capacity: 100_000,
            start_time_ms: 0,
        }
    }
}

/// Outcome of one `advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus<O> {
    Completed(O),
    Failed(WorkflowError),
    /// Every live coroutine is blocked on something only the host can change.
    AwaitingExternalInput,
}

impl<O> ExecutionStatus<O> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::AwaitingExternalInput)
    }
}

/// Identifier of a future the host resolves (activity result or timer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalId(pub u64);

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request from workflow code to the host, drained with
/// [`Dispatcher::take_commands`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run an activity and resolve `id` with its result.
    ScheduleActivity {
        id: ExternalId,
        activity_type: String,
        input: Value,
    },
    /// Durable timer; fired through `advance_logical_clock`.
    StartTimer { id: ExternalId, fire_at_ms: u64 },
    /// The scope owning `id` was canceled before it resolved.
    RequestCancel { id: ExternalId },
}

impl Command {
    pub fn id(&self) -> ExternalId {
        match self {
            Command::ScheduleActivity { id, .. } | Command::StartTimer { id, .. } | Command::RequestCancel { id } => *id,
        }
    }
}
