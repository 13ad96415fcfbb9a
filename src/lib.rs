//! Deterministic coroutine dispatcher for replayable durable workflows.
//!
//! Workflow code is written as ordinary async Rust: spawn coroutines, send and
//! receive on channels, wait on futures, sleep on logical time. The
//! [`Dispatcher`] runs those coroutines one at a time, in spawn order, until
//! every one of them is blocked on something only the host can change. Given
//! the same ordered sequence of host inputs, the sequence of internal
//! decisions is always the same, which is what makes replay possible.
//!
//! ```rust
//! use durable_coroutines::{DispatcherBuilder, ExecutionStatus, WorkflowContext, WorkflowError};
//!
//! let mut dispatcher = DispatcherBuilder::new("split-join").spawn_root(
//!     |ctx: WorkflowContext, _: ()| async move {
//!         let ch = ctx.new_channel::<String>();
//!         let sender = ch.clone();
//!         ctx.go(move |ctx| async move { sender.send(&ctx, "ping".to_string()).await });
//!         let got = ch.receive(&ctx).await?;
//!         Ok::<_, WorkflowError>(got.unwrap_or_default())
//!     },
//!     (),
//! );
//! assert_eq!(dispatcher.advance(), ExecutionStatus::Completed("ping".to_string()));
//! ```
//!
//! The host side drives execution through [`Dispatcher::advance`],
//! delivers results with [`Dispatcher::resolve_future`] and
//! [`Dispatcher::deliver_channel_value`], moves time with
//! [`Dispatcher::advance_logical_clock`], and drains requests with
//! [`Dispatcher::take_commands`]. [`testing::TestWorkflowEnvironment`] does all
//! of that in-process for tests.

pub mod cancel;
pub mod channel;
pub mod context;
pub mod error;
pub mod future;
pub mod logging;
pub mod runtime;
pub mod selector;
pub mod testing;
pub mod wait_group;

pub use cancel::{CallbackKey, CancelHandle, CancellationScope};
pub use channel::Channel;
pub use context::WorkflowContext;
pub use error::{PanicError, WorkflowError};
pub use future::{Settable, WorkflowFuture};
pub use runtime::{
    Command, CoroutineHandle, CoroutineId, CoroutineState, Dispatcher, DispatcherBuilder, DispatcherOptions,
    ExecutionStatus, ExternalId, MetricsProvider, MetricsSnapshot, WorkflowInfo, WorkflowInterceptor,
    WorkflowInterceptorFactory,
};
pub use selector::Selector;
pub use wait_group::WaitGroup;

#[doc(hidden)]
pub use tracing as __tracing;
