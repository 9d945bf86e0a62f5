//! Setpoint dispatcher timing.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use cvd_rig::experiment::schedule::{Schedule, SetpointDispatcher};
use cvd_rig::hardware::flow::FlowCommand;
use tracing_test::traced_test;

fn dispatcher_with(channel: u8, entries: &[(u64, f64)]) -> SetpointDispatcher {
    let mut schedule = Schedule::default();
    for &(at, value) in entries {
        schedule.insert(at, value);
    }
    let mut dispatcher = SetpointDispatcher::new();
    dispatcher.rebuild(BTreeMap::from([(channel, schedule)]));
    dispatcher
}

#[test]
fn test_entries_fire_once_in_their_tick() {
    let mut dispatcher = dispatcher_with(4, &[(0, 10.0), (10, 20.0), (20, 30.0)]);
    let start = Instant::now();
    dispatcher.start(start);

    let mut fired = Vec::new();
    for tick in 0..40u64 {
        let now = start + Duration::from_secs(tick);
        for command in dispatcher.dispatch(now) {
            match command {
                FlowCommand::Setpoint { channel, value } => {
                    assert_eq!(channel, 4);
                    fired.push((tick, value));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
    assert_eq!(fired, vec![(0, 10.0), (10, 20.0), (20, 30.0)]);
    assert_eq!(dispatcher.schedule(4).unwrap().pending(), 0);
}

#[test]
fn test_equal_times_fire_together_in_insertion_order() {
    let mut dispatcher = dispatcher_with(1, &[(5, 1.0), (5, 2.0), (0, 0.5)]);
    let start = Instant::now();
    dispatcher.start(start);
    assert_eq!(dispatcher.dispatch(start).len(), 1);
    let values: Vec<f64> = dispatcher
        .dispatch(start + Duration::from_secs(5))
        .into_iter()
        .map(|c| match c {
            FlowCommand::Setpoint { value, .. } => value,
            FlowCommand::Coil { .. } => f64::NAN,
        })
        .collect();
    assert_eq!(values, vec![1.0, 2.0]);
}

#[test]
fn test_halt_stops_firing_and_rebuild_resets() {
    let mut dispatcher = dispatcher_with(1, &[(0, 1.0), (3, 2.0)]);
    let start = Instant::now();
    dispatcher.start(start);
    assert_eq!(dispatcher.dispatch(start).len(), 1);
    dispatcher.halt();
    assert!(!dispatcher.is_running());
    assert!(dispatcher.dispatch(start + Duration::from_secs(5)).is_empty());

    dispatcher.clear();
    assert!(dispatcher.schedules().is_empty());
}

#[traced_test]
#[test]
fn test_late_firing_is_logged() {
    let mut dispatcher = dispatcher_with(2, &[(10, 5.0)]);
    let start = Instant::now();
    dispatcher.start(start);
    // Tick loop stalled: the next tick lands 3 s after the entry.
    let fired = dispatcher.dispatch(start + Duration::from_secs(13));
    assert_eq!(fired.len(), 1);
    assert!(logs_contain("setpoint fired late"));
    assert!(dispatcher.dispatch(start + Duration::from_secs(14)).is_empty());
}
