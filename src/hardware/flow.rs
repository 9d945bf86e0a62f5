//! Mass-flow controller bank on the CRC16 link.
//!
//! Each channel is a separate device whose address equals its channel number.
//! Register map: 16 process value, 17 set value, 48 full scale, 51 device id.
//! Coil map: 0 close valve, 1 valve control, 2 purge, 3 digital mode, 6 unit.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::link::{transact, Link};
use super::worker::DevicePoller;
use crate::protocol::modbus_rtu::{Request, Response};
use crate::protocol::FlowScale;

/// Process value register
pub const REG_PROCESS_VALUE: u16 = 16;
/// Set value register
pub const REG_SET_VALUE: u16 = 17;
/// Full scale register
pub const REG_FULL_SCALE: u16 = 48;
/// Device id register
pub const REG_DEVICE_ID: u16 = 51;
/// Unit coil (off: mL/min, on: L/min)
pub const COIL_UNIT: u16 = 6;

/// Valve coils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Coil {
    /// Force the valve closed
    CloseValve,
    /// Regulate to the set value
    ValveControl,
    /// Force the valve fully open
    Purge,
    /// Digital set value (off selects the analog input)
    DigitalMode,
}

impl Coil {
    /// Coil address.
    pub fn address(self) -> u16 {
        match self {
            Coil::CloseValve => 0,
            Coil::ValveControl => 1,
            Coil::Purge => 2,
            Coil::DigitalMode => 3,
        }
    }
}

/// Valve switch state read from coils 0..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchState {
    /// Valve closed
    Closed,
    /// Regulating
    ValveControl,
    /// Purging
    Purge,
    /// Any other coil combination
    Other(u8),
}

impl SwitchState {
    /// Decode the packed coil byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SwitchState::Closed,
            2 => SwitchState::ValveControl,
            4 => SwitchState::Purge,
            other => SwitchState::Other(other),
        }
    }
}

/// Engineering unit of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowUnit {
    /// Standard millilitres per minute
    MillilitersPerMinute,
    /// Standard litres per minute
    LitersPerMinute,
}

impl fmt::Display for FlowUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowUnit::MillilitersPerMinute => write!(f, "mL/min"),
            FlowUnit::LitersPerMinute => write!(f, "L/min"),
        }
    }
}

/// Write request for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowCommand {
    /// New set value in physical units
    Setpoint {
        /// Channel (device address)
        channel: u8,
        /// Flow in the channel's unit
        value: f64,
    },
    /// Switch one valve coil
    Coil {
        /// Channel (device address)
        channel: u8,
        /// Coil to switch
        coil: Coil,
        /// On or off
        on: bool,
    },
}

impl FlowCommand {
    /// Channel the command is addressed to.
    pub fn channel(&self) -> u8 {
        match self {
            FlowCommand::Setpoint { channel, .. } | FlowCommand::Coil { channel, .. } => *channel,
        }
    }
}

/// Cached state of one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowChannelState {
    /// Device address
    pub address: u8,
    /// False when the set value could not be read this cycle
    pub present: bool,
    /// Process value, one decimal
    pub process_value: Option<f64>,
    /// Set value, one decimal
    pub set_value: Option<f64>,
    /// Digital control mode
    pub ctrl_mode: Option<bool>,
    /// Valve switch state
    pub switch_state: Option<SwitchState>,
    /// Engineering unit
    pub unit: Option<FlowUnit>,
    /// Full scale in the channel's unit
    pub full_scale: Option<f64>,
}

/// Published copy of all channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowSnapshot {
    /// Channels in polling order
    pub channels: Vec<FlowChannelState>,
}

impl FlowSnapshot {
    /// State of one channel by address.
    pub fn channel(&self, address: u8) -> Option<&FlowChannelState> {
        self.channels.iter().find(|c| c.address == address)
    }
}

/// [`DevicePoller`] for the flow controller bank.
#[derive(Debug, Clone)]
pub struct FlowPoller {
    addresses: Vec<u8>,
    settle: Duration,
    scales: HashMap<u8, FlowScale>,
}

impl FlowPoller {
    /// Poll `addresses`, waiting `settle` after every request.
    pub fn new(addresses: Vec<u8>, settle: Duration) -> Self {
        Self {
            addresses,
            settle,
            scales: HashMap::new(),
        }
    }

    /// Polled addresses.
    pub fn addresses(&self) -> &[u8] {
        &self.addresses
    }

    fn exchange(&self, link: &mut dyn Link, request: Request) -> io::Result<Option<Response>> {
        let response = transact(link, &request.encode(), request.response_len(), self.settle)?;
        Ok(request.parse_response(&response))
    }

    fn read_register(
        &self,
        link: &mut dyn Link,
        address: u8,
        register: u16,
    ) -> io::Result<Option<u16>> {
        Ok(match self.exchange(link, Request::read_registers(address, register, 1))? {
            Some(Response::Registers(words)) => words.first().copied(),
            _ => None,
        })
    }

    fn read_coils(
        &self,
        link: &mut dyn Link,
        address: u8,
        coil: u16,
        count: u16,
    ) -> io::Result<Option<Vec<bool>>> {
        Ok(match self.exchange(link, Request::read_coils(address, coil, count))? {
            Some(Response::Coils(bits)) => Some(bits),
            _ => None,
        })
    }

    fn poll_channel(
        &mut self,
        link: &mut dyn Link,
        state: &mut FlowChannelState,
    ) -> io::Result<()> {
        let address = state.address;
        let Some(set_raw) = self.read_register(link, address, REG_SET_VALUE)? else {
            state.present = false;
            return Ok(());
        };
        state.present = true;

        if let Some(full_scale) = self.read_register(link, address, REG_FULL_SCALE)? {
            match FlowScale::new(f64::from(full_scale)) {
                Some(scale) => {
                    self.scales.insert(address, scale);
                }
                None => {
                    self.scales.remove(&address);
                }
            }
        }
        let scale = self.scales.get(&address).copied();
        state.full_scale = scale.map(|s| s.full_scale());
        state.set_value = scale.map(|s| s.to_display(set_raw));

        let process_raw = self.read_register(link, address, REG_PROCESS_VALUE)?;
        state.process_value = process_raw.zip(scale).map(|(raw, s)| s.to_display(raw));

        state.ctrl_mode = self
            .read_coils(link, address, Coil::DigitalMode.address(), 1)?
            .and_then(|bits| bits.first().copied());

        state.switch_state = self
            .read_coils(link, address, Coil::CloseValve.address(), 3)?
            .map(|bits| {
                let packed = bits
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, on)| acc | (u8::from(*on) << i));
                SwitchState::from_bits(packed)
            });

        state.unit = self
            .read_coils(link, address, COIL_UNIT, 1)?
            .and_then(|bits| bits.first().copied())
            .map(|liters| {
                if liters {
                    FlowUnit::LitersPerMinute
                } else {
                    FlowUnit::MillilitersPerMinute
                }
            });
        Ok(())
    }
}

impl DevicePoller for FlowPoller {
    type Command = FlowCommand;
    type Snapshot = FlowSnapshot;

    fn write(&mut self, link: &mut dyn Link, command: &FlowCommand) -> io::Result<()> {
        let request = match *command {
            FlowCommand::Setpoint { channel, value } => {
                let Some(scale) = self.scales.get(&channel) else {
                    warn!(channel, value, "full scale unknown, set value dropped");
                    return Ok(());
                };
                Request::write_register(channel, REG_SET_VALUE, scale.to_raw(value))
            }
            FlowCommand::Coil { channel, coil, on } => {
                Request::write_coil(channel, coil.address(), on)
            }
        };
        if self.exchange(link, request)?.is_none() {
            debug!(?command, "write not echoed");
        }
        Ok(())
    }

    fn poll(&mut self, link: &mut dyn Link, cache: &mut FlowSnapshot) {
        if cache.channels.len() != self.addresses.len() {
            cache.channels = self
                .addresses
                .iter()
                .map(|&address| FlowChannelState {
                    address,
                    ..Default::default()
                })
                .collect();
        }
        for state in cache.channels.iter_mut() {
            if let Err(e) = self.poll_channel(link, state) {
                trace!(channel = state.address, error = %e, "read failed, keeping last value");
            }
        }
    }
}
