//! Time-indexed flow setpoints.
//!
//! Gas ramps from the order table are turned into per-channel schedules when an
//! order is launched. Once the dispatch clock starts, every tick fires the
//! entries whose time has come. Each entry fires once per schedule lifetime.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use super::order::GasProgram;
use crate::config::MixingConfig;
use crate::hardware::flow::FlowCommand;
use crate::protocol::round1;

/// One scheduled setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleEntry {
    /// Seconds since the dispatch clock started
    pub at_seconds: u64,
    /// Set value in the channel's unit
    pub setpoint: f64,
    fired: bool,
}

impl ScheduleEntry {
    /// Unfired entry.
    pub fn new(at_seconds: u64, setpoint: f64) -> Self {
        Self {
            at_seconds,
            setpoint,
            fired: false,
        }
    }

    /// True once the entry has been dispatched.
    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// Setpoints of one flow channel, ascending in time. Entries with equal times
/// keep insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Add an entry, keeping time order.
    pub fn insert(&mut self, at_seconds: u64, setpoint: f64) {
        let position = self.entries.partition_point(|e| e.at_seconds <= at_seconds);
        self.entries.insert(position, ScheduleEntry::new(at_seconds, setpoint));
    }

    /// Entries in firing order.
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Entries not yet fired.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.fired).count()
    }
}

fn non_negative(channel: u8, at_seconds: u64, value: f64) -> f64 {
    if value < 0.0 {
        warn!(channel, at_seconds, value, "negative set value clamped to 0");
        0.0
    } else {
        value
    }
}

/// Build per-channel schedules from an order's gas ramps.
///
/// The primary and secondary gases of `mixing` are paired point by point; for
/// each pair with equal times the secondary channel gets
/// `secondary / mixture_fraction` and the primary channel gets
/// `primary - cross_factor * secondary`, both rounded to one decimal. Pairs
/// with different times are skipped. A missing secondary gas counts as zero
/// flow. Gases listed in `direct` map straight onto their channel; any other
/// gas is ignored with a warning.
pub fn build_schedules(
    gases: &BTreeMap<String, GasProgram>,
    mixing: &MixingConfig,
    direct: &BTreeMap<String, u8>,
) -> BTreeMap<u8, Schedule> {
    let mut schedules: BTreeMap<u8, Schedule> = BTreeMap::new();

    let primary = gases.get(&mixing.primary_gas);
    let secondary = gases.get(&mixing.secondary_gas);
    let pairs: Vec<(u64, f64, f64)> = match (primary, secondary) {
        (Some(p), Some(s)) => p
            .points
            .iter()
            .zip(&s.points)
            .filter_map(|(p, s)| {
                if p.seconds == s.seconds {
                    Some((p.seconds, p.flow, s.flow))
                } else {
                    warn!(
                        primary_at = p.seconds,
                        secondary_at = s.seconds,
                        "mixed gas points do not line up, skipped"
                    );
                    None
                }
            })
            .collect(),
        (Some(p), None) => p.points.iter().map(|p| (p.seconds, p.flow, 0.0)).collect(),
        (None, Some(s)) => s.points.iter().map(|s| (s.seconds, 0.0, s.flow)).collect(),
        (None, None) => Vec::new(),
    };
    for (at, primary_flow, secondary_flow) in pairs {
        let premix = round1(secondary_flow / mixing.mixture_fraction);
        let carrier = round1(primary_flow - mixing.cross_factor * secondary_flow);
        schedules
            .entry(mixing.secondary_channel)
            .or_default()
            .insert(at, non_negative(mixing.secondary_channel, at, premix));
        schedules
            .entry(mixing.primary_channel)
            .or_default()
            .insert(at, non_negative(mixing.primary_channel, at, carrier));
    }

    for (gas, program) in gases {
        if *gas == mixing.primary_gas || *gas == mixing.secondary_gas {
            continue;
        }
        let Some(&channel) = direct.get(gas) else {
            warn!(gas = %gas, "gas has no flow channel, ignored");
            continue;
        };
        let schedule = schedules.entry(channel).or_default();
        for point in &program.points {
            schedule.insert(point.seconds, non_negative(channel, point.seconds, point.flow));
        }
    }
    schedules
}

/// Fires scheduled setpoints against a dispatch clock.
#[derive(Debug, Clone, Default)]
pub struct SetpointDispatcher {
    schedules: BTreeMap<u8, Schedule>,
    started_at: Option<Instant>,
}

impl SetpointDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all schedules and stop the clock.
    pub fn rebuild(&mut self, schedules: BTreeMap<u8, Schedule>) {
        self.schedules = schedules;
        self.started_at = None;
    }

    /// Drop all schedules and stop the clock.
    pub fn clear(&mut self) {
        self.rebuild(BTreeMap::new());
    }

    /// Start the dispatch clock.
    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
    }

    /// Stop the dispatch clock; nothing fires until the next start.
    pub fn halt(&mut self) {
        self.started_at = None;
    }

    /// True while the clock runs.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Seconds since the clock started.
    pub fn elapsed(&self, now: Instant) -> Option<f64> {
        self.started_at
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
    }

    /// Schedule of one channel.
    pub fn schedule(&self, channel: u8) -> Option<&Schedule> {
        self.schedules.get(&channel)
    }

    /// All schedules by channel.
    pub fn schedules(&self) -> &BTreeMap<u8, Schedule> {
        &self.schedules
    }

    /// Fire every unfired entry whose time has come, channel by channel in
    /// schedule order. Entries reached one second or more late are logged.
    pub fn dispatch(&mut self, now: Instant) -> Vec<FlowCommand> {
        let Some(elapsed) = self.elapsed(now) else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        for (&channel, schedule) in self.schedules.iter_mut() {
            for entry in schedule.entries.iter_mut() {
                if entry.fired || elapsed < entry.at_seconds as f64 {
                    continue;
                }
                entry.fired = true;
                let lateness = elapsed - entry.at_seconds as f64;
                if lateness >= 1.0 {
                    warn!(channel, at = entry.at_seconds, lateness, "setpoint fired late");
                } else {
                    debug!(
                        channel,
                        at = entry.at_seconds,
                        setpoint = entry.setpoint,
                        "setpoint fired"
                    );
                }
                commands.push(FlowCommand::Setpoint {
                    channel,
                    value: entry.setpoint,
                });
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::order::GasPoint;

    fn ramp(points: &[(u64, f64)]) -> GasProgram {
        GasProgram {
            points: points
                .iter()
                .map(|&(seconds, flow)| GasPoint { seconds, flow })
                .collect(),
        }
    }

    #[test]
    fn mixing_splits_premix_and_carrier() {
        let mut gases = BTreeMap::new();
        gases.insert("Ar".to_string(), ramp(&[(0, 100.0), (600, 50.0)]));
        gases.insert("H2".to_string(), ramp(&[(0, 1.31), (600, 0.0)]));
        let schedules = build_schedules(&gases, &MixingConfig::default(), &BTreeMap::new());

        let premix = &schedules[&0];
        assert_eq!(premix.entries()[0].setpoint, 10.0);
        assert_eq!(premix.entries()[1].setpoint, 0.0);
        let carrier = &schedules[&2];
        // 100 - 1179/131 * 1.31 = 100 - 11.79
        assert_eq!(carrier.entries()[0].setpoint, 88.2);
        assert_eq!(carrier.entries()[1], ScheduleEntry::new(600, 50.0));
    }

    #[test]
    fn misaligned_pairs_are_skipped() {
        let mut gases = BTreeMap::new();
        gases.insert("Ar".to_string(), ramp(&[(0, 100.0), (60, 80.0)]));
        gases.insert("H2".to_string(), ramp(&[(0, 0.0), (90, 0.0)]));
        let schedules = build_schedules(&gases, &MixingConfig::default(), &BTreeMap::new());
        assert_eq!(schedules[&2].entries().len(), 1);
    }

    #[test]
    fn direct_gases_map_to_their_channel() {
        let mut gases = BTreeMap::new();
        gases.insert("N2".to_string(), ramp(&[(30, 5.0), (0, 2.0)]));
        gases.insert("Xe".to_string(), ramp(&[(0, 1.0)]));
        let direct = BTreeMap::from([("N2".to_string(), 7u8)]);
        let schedules = build_schedules(&gases, &MixingConfig::default(), &direct);
        let n2 = &schedules[&7];
        assert_eq!(n2.entries()[0].at_seconds, 0);
        assert_eq!(n2.entries()[1].at_seconds, 30);
        assert_eq!(schedules.len(), 1);
    }

    #[test]
    fn nothing_fires_before_start() {
        let mut dispatcher = SetpointDispatcher::new();
        let mut schedule = Schedule::default();
        schedule.insert(0, 1.0);
        dispatcher.rebuild(BTreeMap::from([(0u8, schedule)]));
        assert!(dispatcher.dispatch(Instant::now()).is_empty());
        assert_eq!(dispatcher.schedule(0).unwrap().pending(), 1);
    }
}
