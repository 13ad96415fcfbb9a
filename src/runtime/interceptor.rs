//! Interceptor chain around workflow execution and activity scheduling.
//!
//! Factories are applied once per execution. The first registered factory
//! produces the outermost interceptor; the innermost link is the built-in
//! terminal that runs the workflow body and issues activity commands.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::future::WorkflowFuture;

/// Boxed workflow body as seen by interceptors.
pub type WorkflowBody = LocalBoxFuture<'static, Result<(), WorkflowError>>;

/// Static information about the execution an interceptor is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInfo {
    pub workflow_type: String,
}

/// One link of the chain. Implementors override what they need and forward
/// the rest through the default methods.
pub trait WorkflowInterceptor {
    /// Next link, `None` for the terminal.
    fn next(&self) -> Option<&Rc<dyn WorkflowInterceptor>>;

    fn execute_workflow(&self, ctx: &WorkflowContext, workflow_type: &str, body: WorkflowBody) -> WorkflowBody {
        match self.next() {
            Some(next) => next.execute_workflow(ctx, workflow_type, body),
            None => body,
        }
    }

    fn execute_activity(&self, ctx: &WorkflowContext, activity_type: &str, input: Value) -> WorkflowFuture<Value> {
        match self.next() {
            Some(next) => next.execute_activity(ctx, activity_type, input),
            None => ctx.schedule_activity(activity_type, input),
        }
    }
}

pub trait WorkflowInterceptorFactory {
    fn new_interceptor(&self, info: &WorkflowInfo, next: Rc<dyn WorkflowInterceptor>) -> Rc<dyn WorkflowInterceptor>;
}

struct TerminalInterceptor;

impl WorkflowInterceptor for TerminalInterceptor {
    fn next(&self) -> Option<&Rc<dyn WorkflowInterceptor>> {
        None
    }
}

/// Build the chain; the first factory ends up outermost.
pub(crate) fn build_chain(
    info: &WorkflowInfo,
    factories: &[Rc<dyn WorkflowInterceptorFactory>],
) -> Rc<dyn WorkflowInterceptor> {
    let mut head: Rc<dyn WorkflowInterceptor> = Rc::new(TerminalInterceptor);
    for factory in factories.iter().rev() {
        head = factory.new_interceptor(info, head);
    }
    head
}
