//! Property-based tests over randomized host input sequences.

use std::cell::RefCell;
use std::rc::Rc;

use durable_coroutines::{CoroutineId, DispatcherBuilder, ExecutionStatus, WorkflowContext, WorkflowError};
use proptest::prelude::*;

/// One host step: fire a signal, or move the logical clock forward.
#[derive(Debug, Clone)]
enum HostStep {
    Signal(u8),
    Tick(u64),
}

fn arb_step() -> impl Strategy<Value = HostStep> {
    prop_oneof![
        (0u8..4).prop_map(HostStep::Signal),
        (1u64..50).prop_map(HostStep::Tick),
    ]
}

type Outcome = (ExecutionStatus<Vec<String>>, Vec<CoroutineId>, Vec<String>);

/// Pipeline of coroutines: timers feed a channel, signals feed another, a
/// selector merges both, and a wait group joins the producers.
fn run(workers: u32, steps: &[HostStep]) -> Outcome {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let mut dispatcher = DispatcherBuilder::new("pipeline").spawn_root(
        move |ctx: WorkflowContext, workers: u32| async move {
            let ticks = ctx.new_buffered_channel::<u32>(2);
            let signals = ctx.signal_channel::<u8>("poke");
            let wg = ctx.new_wait_group();
            wg.add(workers as i64)?;
            for i in 0..workers {
                let (ticks, wg, sink) = (ticks.clone(), wg.clone(), sink.clone());
                ctx.go(move |ctx| async move {
                    ctx.sleep(10 * (u64::from(i) + 1)).await?;
                    sink.borrow_mut().push(format!("worker {i} woke at {}", ctx.now_ms()));
                    ticks.send(&ctx, i).await?;
                    wg.done()
                });
            }
            let closer = ticks.clone();
            let waiter = wg.clone();
            ctx.go(move |ctx| async move {
                waiter.wait(&ctx).await?;
                closer.close();
                Ok::<_, WorkflowError>(())
            });

            let mut merged = Vec::new();
            loop {
                let mut selector = ctx.new_selector();
                selector
                    .add_receive(&ticks, |v: Option<u32>| v.map(|i| format!("tick {i}")))
                    .add_receive(&signals, |v: Option<u8>| v.map(|s| format!("signal {s}")));
                match selector.select(&ctx).await? {
                    Some(item) => merged.push(item),
                    None => break,
                }
            }
            Ok::<_, WorkflowError>(merged)
        },
        workers,
    );

    let mut status = dispatcher.advance();
    for step in steps {
        if status.is_terminal() {
            break;
        }
        match step {
            HostStep::Signal(s) => {
                let _ = dispatcher.deliver_channel_value("poke", serde_json::json!(s));
            }
            HostStep::Tick(ms) => {
                let to = dispatcher.now_ms() + ms;
                dispatcher.advance_logical_clock(to);
            }
        }
        status = dispatcher.advance();
    }
    let trace = dispatcher.resumption_trace().to_vec();
    let log = events.borrow().clone();
    (status, trace, log)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Replaying the same host input sequence reproduces the same resumption
    /// trace, coroutine-visible log and outcome.
    #[test]
    fn prop_replay_is_deterministic(
        workers in 1u32..5,
        steps in prop::collection::vec(arb_step(), 0..30),
    ) {
        let first = run(workers, &steps);
        let second = run(workers, &steps);
        prop_assert_eq!(first, second);
    }

    /// Workers always wake in deadline order regardless of how the clock is
    /// moved.
    #[test]
    fn prop_timers_fire_in_deadline_order(
        workers in 1u32..5,
        steps in prop::collection::vec(arb_step(), 0..30),
    ) {
        let (_, _, log) = run(workers, &steps);
        let woken: Vec<u32> = log
            .iter()
            .filter_map(|line| line.split_whitespace().nth(1).and_then(|n| n.parse().ok()))
            .collect();
        let mut sorted = woken.clone();
        sorted.sort_unstable();
        prop_assert_eq!(woken, sorted);
    }

    /// Merged signals are a prefix of the delivered ones: nothing is lost out
    /// of order or merged twice.
    #[test]
    fn prop_signals_are_merged_in_order(
        steps in prop::collection::vec(arb_step(), 0..30),
    ) {
        let mut steps = steps;
        // Move past every worker deadline so the pipeline completes.
        steps.push(HostStep::Tick(1_000));
        let (status, _, _) = run(1, &steps);
        let ExecutionStatus::Completed(merged) = status else {
            return Err(TestCaseError::fail("pipeline did not complete"));
        };
        let delivered: Vec<String> = steps
            .iter()
            .filter_map(|step| match step {
                HostStep::Signal(s) => Some(format!("signal {s}")),
                HostStep::Tick(_) => None,
            })
            .collect();
        let received: Vec<String> = merged.into_iter().filter(|m| m.starts_with("signal")).collect();
        prop_assert!(delivered.starts_with(&received));
    }
}
