//! Replay-aware workflow logging and dispatcher lifecycle events.

mod common;

use common::tracing_capture::install_tracing_capture;
use durable_coroutines::runtime::observability::{LogFormat, ObservabilityConfig};
use durable_coroutines::testing::TestWorkflowEnvironment;
use durable_coroutines::{
    DispatcherBuilder, ExecutionStatus, WorkflowContext, WorkflowError, workflow_info, workflow_warn,
};
use serde_json::Value;
use tracing::Level;

#[test]
fn workflow_logs_are_suppressed_while_replaying() {
    let (events, _guard) = install_tracing_capture();
    let mut dispatcher = DispatcherBuilder::new("logging").spawn_root(
        |ctx: WorkflowContext, _: ()| async move {
            workflow_info!(ctx, step = "start", "workflow started");
            let inbox = ctx.signal_channel::<Value>("inbox");
            inbox.receive(&ctx).await?;
            workflow_warn!(ctx, step = "signal", "signal received");
            Ok::<_, WorkflowError>(())
        },
        (),
    );

    dispatcher.set_replaying(true);
    assert_eq!(dispatcher.advance(), ExecutionStatus::AwaitingExternalInput);
    assert!(events.with_message("workflow started").is_empty());

    dispatcher.set_replaying(false);
    dispatcher.deliver_channel_value("inbox", Value::Null).unwrap();
    assert_eq!(dispatcher.advance(), ExecutionStatus::Completed(()));

    let received = events.with_message("signal received");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].level, Level::WARN);
    assert_eq!(received[0].field("workflow_type").as_deref(), Some("logging"));
    assert_eq!(received[0].field("step").as_deref(), Some("signal"));
    assert_eq!(received[0].field("now_ms").as_deref(), Some("0"));
}

#[test]
fn dispatcher_reports_completion_and_failure() {
    let (events, _guard) = install_tracing_capture();

    let mut env = TestWorkflowEnvironment::new("lifecycle-ok");
    env.execute_workflow(|_ctx: WorkflowContext, _: ()| async { Ok::<_, WorkflowError>(1) }, ());
    let mut env = TestWorkflowEnvironment::new("lifecycle-err");
    env.execute_workflow(
        |_ctx: WorkflowContext, _: ()| async { Err::<(), _>(WorkflowError::application("nope")) },
        (),
    );

    let completed = events.with_message("workflow completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].field("workflow_type").as_deref(), Some("lifecycle-ok"));

    let failed = events.with_message("workflow failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].level, Level::ERROR);
    assert_eq!(failed[0].field("error_type").as_deref(), Some("app_error"));
    assert_eq!(env.metrics().workflow_failures, 1);
}

#[test]
fn coroutine_panic_is_logged_with_its_name() {
    let (events, _guard) = install_tracing_capture();
    let mut env = TestWorkflowEnvironment::new("panicLog");
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let child = ctx.go_named("fragile", |_ctx| async move {
                if true {
                    panic!("fragile broke");
                }
                Ok::<_, WorkflowError>(())
            });
            Ok::<_, WorkflowError>(child.join(&ctx).await.is_err())
        },
        (),
    );
    assert_eq!(run.output(), Some(&true));
    let panics = events.with_message("coroutine panicked");
    assert_eq!(panics.len(), 1);
    assert_eq!(panics[0].field("coroutine").as_deref(), Some("fragile"));
    assert_eq!(panics[0].field("error").as_deref(), Some("fragile broke"));
}

#[test]
fn stuck_workflow_is_reported_with_stack() {
    let (events, _guard) = install_tracing_capture();
    let mut env = TestWorkflowEnvironment::new("stuck");
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            ctx.new_named_channel::<u8>("nowhere").receive(&ctx).await
        },
        (),
    );
    assert!(run.is_stuck());
    let warnings = events.at_level(Level::WARN);
    let stuck = warnings
        .iter()
        .find(|e| e.message == "workflow blocked with nothing pending")
        .expect("stuck warning");
    assert_eq!(
        stuck.field("stack").as_deref(),
        Some("coroutine root [blocked on nowhere.Receive]\n")
    );
}

#[test]
fn default_config_is_compact_at_info() {
    let config = ObservabilityConfig::default();
    assert_eq!(config.log_format, LogFormat::Compact);
    assert_eq!(config.log_level, "info");
}
