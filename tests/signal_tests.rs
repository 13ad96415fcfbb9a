//! Named signal channels fed by the host, including malformed payloads.

mod common;

use common::tracing_capture::install_tracing_capture;
use durable_coroutines::testing::TestWorkflowEnvironment;
use durable_coroutines::{WorkflowContext, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Level;

const HOUR_MS: u64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    value: String,
}

fn expected_signals() -> Vec<String> {
    [
        "Sig1Value1;",
        "Sig1Value2;",
        "Sig2Value1;",
        "Sig2Value2;",
        "Sig2Value3;",
        "Sig2Value4;",
        "Sig2Value5;",
        "Sig2Value6;",
        "Sig2Value7;",
        "Sig3Value1;",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

async fn signal_workflow(ctx: WorkflowContext, _: ()) -> Result<String, WorkflowError> {
    let mut result = String::new();

    let sig1 = ctx.signal_channel::<String>("testSig1");
    let first = sig1
        .receive_async()
        .ok_or_else(|| WorkflowError::application("testSig1 not received"))?;
    result += &first;
    result += &sig1.receive(&ctx).await?.unwrap_or_default();

    let sig2 = ctx.signal_channel::<String>("testSig2");
    for _ in 0..3 {
        let mut selector = ctx.new_selector();
        selector.add_receive(&sig2, |v: Option<String>| v.unwrap_or_default());
        result += &selector.select(&ctx).await?;
    }

    let mut selector = ctx.new_selector();
    selector.add_receive(&sig2, |v: Option<String>| v.unwrap_or_default());
    result += &selector.select(&ctx).await?;
    for _ in 0..3 {
        result += &sig2.receive(&ctx).await?.unwrap_or_default();
    }

    if ctx.unhandled_signal_names() != ["testSig3"] {
        return Err(WorkflowError::application("expecting one unhandled signal"));
    }
    let sig3 = ctx.signal_channel::<String>("testSig3");
    result += &sig3.receive(&ctx).await?.unwrap_or_default();
    if !ctx.unhandled_signal_names().is_empty() {
        return Err(WorkflowError::application("expecting no unhandled signals"));
    }
    Ok(result)
}

#[test]
fn signals_are_received_in_delivery_order() {
    let expected = expected_signals();
    let mut env = TestWorkflowEnvironment::new("signalWorkflowTest");
    for (i, msg) in expected.iter().take(2).cloned().enumerate() {
        let delay = if i > 0 { 1_000 } else { 0 };
        env.register_delayed_callback(delay, move |host| {
            host.deliver_channel_value("testSig1", json!(msg)).unwrap();
        });
    }
    let sig3 = expected[9].clone();
    env.register_delayed_callback(HOUR_MS, move |host| {
        host.deliver_channel_value("testSig3", json!(sig3)).unwrap();
    });
    for msg in expected[2..9].iter().cloned() {
        env.register_delayed_callback(HOUR_MS, move |host| {
            host.deliver_channel_value("testSig2", json!(msg)).unwrap();
        });
    }

    let run = env.execute_workflow(signal_workflow, ());

    assert_eq!(run.output(), Some(&expected.concat()));
    assert!(run.dispatcher.unhandled_channel_names().is_empty());
}

#[test]
fn corrupted_signal_is_dropped_and_counted() {
    let (events, _guard) = install_tracing_capture();
    let mut env = TestWorkflowEnvironment::new("receiveCorruptSignalWorkflowTest");
    env.register_delayed_callback(1, |host| {
        host.deliver_channel_value("channelExpectingTypeMessage", json!("wrong"))
            .unwrap();
    });
    env.register_delayed_callback(1_000, |host| {
        host.deliver_channel_value(
            "channelExpectingTypeMessage",
            json!({ "value": "the right interface" }),
        )
        .unwrap();
    });

    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let ch = ctx.signal_channel::<Message>("channelExpectingTypeMessage");
            let m = ch.receive(&ctx).await?;
            Ok::<_, WorkflowError>(m.into_iter().collect::<Vec<_>>())
        },
        (),
    );

    assert_eq!(
        run.output(),
        Some(&vec![Message {
            value: "the right interface".to_string()
        }])
    );
    assert_eq!(env.metrics().corrupted_signals, 1);
    let warnings = events.with_message("dropping corrupted payload");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].level, Level::WARN);
    assert_eq!(
        warnings[0].field("channel").as_deref(),
        Some("channelExpectingTypeMessage")
    );
}

#[test]
fn corrupted_signal_on_selector_read_is_dropped() {
    let mut env = TestWorkflowEnvironment::new("receiveWithSelectorCorruptSignalWorkflowTest");
    env.register_delayed_callback(1_000, |host| {
        host.deliver_channel_value("channelExpectingTypeMessage", json!("wrong"))
            .unwrap();
    });
    env.register_delayed_callback(3_000, |host| {
        host.deliver_channel_value(
            "channelExpectingTypeMessage",
            json!({ "value": "the right interface" }),
        )
        .unwrap();
    });

    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let ch = ctx.signal_channel::<Message>("channelExpectingTypeMessage");
            let mut selector = ctx.new_selector();
            selector.add_receive(&ch, |m: Option<Message>| m.into_iter().collect::<Vec<_>>());
            let received = selector.select(&ctx).await?;
            Ok::<_, WorkflowError>((received, ctx.now_ms()))
        },
        (),
    );

    let (received, now_ms) = run.output().cloned().expect("completed");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].value, "the right interface");
    assert_eq!(now_ms, 3_000);
    assert_eq!(env.metrics().corrupted_signals, 1);
}

#[test]
fn receive_async_skips_every_corrupted_value() {
    let mut env = TestWorkflowEnvironment::new("receiveAsyncCorruptSignalWorkflowTest");
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let raw = ctx.signal_channel::<String>("channelExpectingTypeMessage");
            let typed = ctx.signal_channel::<Message>("channelExpectingTypeMessage");
            let mut result = Vec::new();

            raw.send_async("wrong".to_string())?;
            result.extend(typed.receive_async());

            raw.send_async("wrong again".to_string())?;
            typed.send_async(Message {
                value: "the right interface".to_string(),
            })?;
            result.extend(typed.receive_async());
            Ok::<_, WorkflowError>(result)
        },
        (),
    );

    let result = run.output().cloned().expect("completed");
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].value, "the right interface");
    assert_eq!(env.metrics().corrupted_signals, 2);
}

#[test]
fn corrupted_value_on_closed_channel_reads_as_closed() {
    let mut env = TestWorkflowEnvironment::new("receiveAsyncCorruptSignalOnClosedChannelWorkflowTest");
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let raw = ctx.signal_channel::<String>("channelExpectingInt");
            let typed = ctx.signal_channel::<i64>("channelExpectingInt");
            raw.send_async("wrong".to_string())?;
            raw.close();
            Ok::<_, WorkflowError>(typed.receive_async_with_more())
        },
        (),
    );
    assert_eq!(run.output(), Some(&(None, false)));
    assert_eq!(env.metrics().corrupted_signals, 1);
}

#[test]
fn receive_on_closed_signal_channel_completes() {
    let mut env = TestWorkflowEnvironment::new("receiveCorruptSignalOnClosedChannelWorkflowTest");
    env.register_delayed_callback(1_000, |host| {
        host.deliver_channel_value("channelExpectingTypeMessage", json!("wrong"))
            .unwrap();
    });
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let ch = ctx.signal_channel::<Message>("channelExpectingTypeMessage");
            ch.close();
            let more = ch.receive(&ctx).await?.is_some();
            Ok::<_, WorkflowError>(vec![Message {
                value: more.to_string(),
            }])
        },
        (),
    );
    let result = run.output().cloned().expect("completed");
    assert_eq!(result[0].value, "false");
}

#[test]
fn host_close_wakes_signal_receiver() {
    let mut env = TestWorkflowEnvironment::new("hostClose");
    env.register_delayed_callback(500, |host| host.close_channel("updates"));
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let updates = ctx.signal_channel::<u32>("updates");
            let got = updates.receive(&ctx).await?;
            Ok::<_, WorkflowError>((got, ctx.now_ms()))
        },
        (),
    );
    assert_eq!(run.output(), Some(&(None, 500)));
}

#[test]
fn full_signal_channel_rejects_delivery() {
    let mut env = TestWorkflowEnvironment::with_options(durable_coroutines::DispatcherOptions {
        workflow_type: "tinyInbox".to_string(),
        signal_channel_capacity: 1,
        ..Default::default()
    });
    let outcomes = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = outcomes.clone();
    env.register_delayed_callback(10, move |host| {
        for i in 0..2 {
            sink.borrow_mut().push(host.deliver_channel_value("inbox", json!(i)).is_ok());
        }
    });
    let run = env.execute_workflow(
        |ctx: WorkflowContext, _: ()| async move {
            let inbox = ctx.signal_channel::<u32>("inbox");
            ctx.sleep(20).await?;
            Ok::<_, WorkflowError>(inbox.receive_async())
        },
        (),
    );
    assert_eq!(run.output(), Some(&Some(0)));
    assert_eq!(*outcomes.borrow(), vec![true, false]);
}
