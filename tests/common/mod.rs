#![allow(dead_code)]

pub mod tracing_capture;

use std::cell::RefCell;
use std::rc::Rc;

use durable_coroutines::runtime::WorkflowBody;
use durable_coroutines::{
    Command, Dispatcher, ExternalId, WorkflowContext, WorkflowFuture, WorkflowInfo, WorkflowInterceptor,
    WorkflowInterceptorFactory,
};
use serde_json::Value;

pub type Trace = Rc<RefCell<Vec<String>>>;

/// Interceptor that records workflow begin/end and every activity request.
pub struct TracingInterceptor {
    next: Rc<dyn WorkflowInterceptor>,
    trace: Trace,
}

impl WorkflowInterceptor for TracingInterceptor {
    fn next(&self) -> Option<&Rc<dyn WorkflowInterceptor>> {
        Some(&self.next)
    }

    fn execute_workflow(&self, ctx: &WorkflowContext, workflow_type: &str, body: WorkflowBody) -> WorkflowBody {
        let trace = self.trace.clone();
        let workflow_type = workflow_type.to_string();
        let inner = self.next.execute_workflow(ctx, &workflow_type, body);
        Box::pin(async move {
            trace.borrow_mut().push(format!("ExecuteWorkflow {workflow_type} begin"));
            let outcome = inner.await;
            trace.borrow_mut().push(format!("ExecuteWorkflow {workflow_type} end"));
            outcome
        })
    }

    fn execute_activity(&self, ctx: &WorkflowContext, activity_type: &str, input: Value) -> WorkflowFuture<Value> {
        self.trace.borrow_mut().push(format!("ExecuteActivity {activity_type}"));
        self.next.execute_activity(ctx, activity_type, input)
    }
}

/// Hands out one [`TracingInterceptor`] per execution and keeps their traces.
#[derive(Default)]
pub struct TracingInterceptorFactory {
    pub instances: RefCell<Vec<Trace>>,
}

impl TracingInterceptorFactory {
    pub fn last_trace(&self) -> Vec<String> {
        self.instances
            .borrow()
            .last()
            .map(|trace| trace.borrow().clone())
            .unwrap_or_default()
    }
}

impl WorkflowInterceptorFactory for TracingInterceptorFactory {
    fn new_interceptor(&self, _info: &WorkflowInfo, next: Rc<dyn WorkflowInterceptor>) -> Rc<dyn WorkflowInterceptor> {
        let trace = Trace::default();
        self.instances.borrow_mut().push(trace.clone());
        Rc::new(TracingInterceptor { next, trace })
    }
}

/// Drain commands and return the scheduled activities as `(id, type, input)`.
pub fn scheduled_activities<O>(dispatcher: &mut Dispatcher<O>) -> Vec<(ExternalId, String, Value)> {
    dispatcher
        .take_commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::ScheduleActivity {
                id,
                activity_type,
                input,
            } => Some((id, activity_type, input)),
            _ => None,
        })
        .collect()
}
