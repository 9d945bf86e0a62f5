//! Dual-zone temperature controller on the sum-checksum link.
//!
//! Zone A answers at device address 1, zone B at address 2. Every poll reads
//! process value, set value, output, program step, minutes into the step and
//! run state for both zones.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::link::{transact, Link};
use super::worker::DevicePoller;
use crate::protocol::aibus::{self, Alarms, Reply};

/// Temperature zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    /// Upstream zone, device address 1
    A,
    /// Downstream zone, device address 2; progress and completion follow it
    B,
}

impl Zone {
    /// Both zones in address order.
    pub const ALL: [Zone; 2] = [Zone::A, Zone::B];

    /// Device address on the link.
    pub fn address(self) -> u8 {
        match self {
            Zone::A => 1,
            Zone::B => 2,
        }
    }

    /// Index into [`TemperatureSnapshot::zones`].
    pub fn index(self) -> usize {
        match self {
            Zone::A => 0,
            Zone::B => 1,
        }
    }

    /// Column prefix in order tables.
    pub fn label(self) -> &'static str {
        match self {
            Zone::A => "A",
            Zone::B => "B",
        }
    }
}

/// Program run state (parameter 27).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Program running
    Run,
    /// Program stopped
    Stop,
    /// Program held at the current step
    Hold,
}

impl RunState {
    /// Wire code.
    pub fn code(self) -> f64 {
        match self {
            RunState::Run => 0.0,
            RunState::Stop => 1.0,
            RunState::Hold => 2.0,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: f64) -> Option<Self> {
        match code as i64 {
            0 => Some(RunState::Run),
            1 => Some(RunState::Stop),
            2 => Some(RunState::Hold),
            _ => None,
        }
    }
}

/// Write one controller parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempCommand {
    /// Target zone
    pub zone: Zone,
    /// Parameter number
    pub param: u8,
    /// Physical value; fixed-point scaling is applied by the codec
    pub value: f64,
}

impl TempCommand {
    /// Change the run state of a zone's program.
    pub fn run_state(zone: Zone, state: RunState) -> Self {
        Self {
            zone,
            param: aibus::PARAM_RUN_STATE,
            value: state.code(),
        }
    }

    /// Write entry `index` of the flattened program table
    /// (`temperature, minutes, temperature, minutes, ...`).
    pub fn program_entry(zone: Zone, index: usize, value: f64) -> Self {
        Self {
            zone,
            param: aibus::PARAM_PROGRAM_BASE.saturating_add(index.min(255) as u8),
            value,
        }
    }
}

/// Cached state of one zone. `None` means unknown this cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZoneState {
    /// Process value, °C
    pub process_value: Option<f64>,
    /// Set value, °C
    pub set_value: Option<f64>,
    /// Output, percent
    pub output: Option<f64>,
    /// Program step, 1-based
    pub step: Option<u32>,
    /// Minutes into the current step
    pub step_minutes: Option<f64>,
    /// Program run state
    pub run_state: Option<RunState>,
    /// Alarm flags from the last decoded reply
    pub alarms: Option<Alarms>,
}

/// Published copy of both zones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemperatureSnapshot {
    /// Zone A then zone B
    pub zones: [ZoneState; 2],
}

impl TemperatureSnapshot {
    /// State of one zone.
    pub fn zone(&self, zone: Zone) -> &ZoneState {
        &self.zones[zone.index()]
    }

    /// Mutable state of one zone.
    pub fn zone_mut(&mut self, zone: Zone) -> &mut ZoneState {
        &mut self.zones[zone.index()]
    }
}

/// Post-write delays of the controller.
#[derive(Debug, Clone, Copy)]
pub struct AibusTiming {
    /// Wait after a read request
    pub read_delay: Duration,
    /// Wait after a write request
    pub write_delay: Duration,
}

impl Default for AibusTiming {
    fn default() -> Self {
        Self {
            read_delay: Duration::from_millis(80),
            write_delay: Duration::from_millis(50),
        }
    }
}

impl AibusTiming {
    /// No delays, for simulated links.
    pub fn immediate() -> Self {
        Self {
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
        }
    }
}

const POLLED_PARAMS: [u8; 6] = [
    aibus::PARAM_PROCESS_VALUE,
    aibus::PARAM_SET_VALUE,
    aibus::PARAM_OUTPUT,
    aibus::PARAM_STEP,
    aibus::PARAM_STEP_TIME,
    aibus::PARAM_RUN_STATE,
];

/// [`DevicePoller`] for the temperature controller.
#[derive(Debug, Clone, Default)]
pub struct TemperaturePoller {
    timing: AibusTiming,
}

impl TemperaturePoller {
    /// Poller with explicit timing.
    pub fn new(timing: AibusTiming) -> Self {
        Self { timing }
    }

    fn read(&self, link: &mut dyn Link, zone: Zone, param: u8) -> io::Result<Option<Reply>> {
        let request = aibus::read_request(zone.address(), param);
        let response = transact(link, &request, aibus::RESPONSE_LEN, self.timing.read_delay)?;
        Ok(aibus::decode(zone.address(), param, &response))
    }
}

fn apply(state: &mut ZoneState, param: u8, reply: Option<&Reply>) {
    let value = reply.map(|r| r.param_value);
    match param {
        aibus::PARAM_PROCESS_VALUE => {
            state.process_value = value;
            state.alarms = reply.map(|r| r.alarms);
        }
        aibus::PARAM_SET_VALUE => state.set_value = value,
        aibus::PARAM_OUTPUT => state.output = value,
        aibus::PARAM_STEP => state.step = value.filter(|v| *v >= 0.0).map(|v| v as u32),
        aibus::PARAM_STEP_TIME => state.step_minutes = value,
        aibus::PARAM_RUN_STATE => state.run_state = value.and_then(RunState::from_code),
        _ => {}
    }
}

impl DevicePoller for TemperaturePoller {
    type Command = TempCommand;
    type Snapshot = TemperatureSnapshot;

    fn write(&mut self, link: &mut dyn Link, command: &TempCommand) -> io::Result<()> {
        let address = command.zone.address();
        let request = aibus::write_request(address, command.param, command.value);
        let response = transact(link, &request, aibus::RESPONSE_LEN, self.timing.write_delay)?;
        if !aibus::validate(address, &response) {
            debug!(?command, "write not acknowledged");
        }
        Ok(())
    }

    fn poll(&mut self, link: &mut dyn Link, cache: &mut TemperatureSnapshot) {
        for zone in Zone::ALL {
            for param in POLLED_PARAMS {
                match self.read(link, zone, param) {
                    Ok(reply) => apply(cache.zone_mut(zone), param, reply.as_ref()),
                    Err(e) => trace!(?zone, param, error = %e, "read failed, keeping last value"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_entries_map_to_parameters() {
        assert_eq!(TempCommand::program_entry(Zone::A, 0, 25.0).param, 80);
        assert_eq!(TempCommand::program_entry(Zone::B, 5, 30.0).param, 85);
        let stop = TempCommand::run_state(Zone::B, RunState::Stop);
        assert_eq!((stop.param, stop.value), (27, 1.0));
    }

    #[test]
    fn undecodable_reply_clears_field() {
        let mut state = ZoneState {
            process_value: Some(100.0),
            ..Default::default()
        };
        apply(&mut state, aibus::PARAM_PROCESS_VALUE, None);
        assert_eq!(state.process_value, None);
    }

    #[test]
    fn run_state_codes() {
        assert_eq!(RunState::from_code(2.0), Some(RunState::Hold));
        assert_eq!(RunState::from_code(7.0), None);
    }
}
