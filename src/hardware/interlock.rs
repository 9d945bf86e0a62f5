//! PLC interlock on a CRC16 link.
//!
//! The rig writes its current intent (fire / rerun / idle) into one holding
//! register every tick and reads a fixed-width discrete-input vector each poll.
//! A specific input pattern asks the rig to run the next order.

use std::io;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use super::link::{transact, Link};
use super::worker::DevicePoller;
use crate::config::InterlockConfig;
use crate::error::{AppResult, RigError};
use crate::protocol::modbus_rtu::{Request, Response};

/// What the rig wants the external logic to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Intent {
    /// Completion condition met: unload and restart
    Fire,
    /// Restart request observed
    Rerun,
    /// Neither
    Idle,
}

/// Register codes for each intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentCodes {
    /// Code for [`Intent::Fire`]
    pub fire: u16,
    /// Code for [`Intent::Rerun`]
    pub rerun: u16,
    /// Code for [`Intent::Idle`]
    pub idle: u16,
}

impl Default for IntentCodes {
    fn default() -> Self {
        Self {
            fire: 121,
            rerun: 63,
            idle: 120,
        }
    }
}

impl IntentCodes {
    /// Code written for `intent`.
    pub fn code(&self, intent: Intent) -> u16 {
        match intent {
            Intent::Fire => self.fire,
            Intent::Rerun => self.rerun,
            Intent::Idle => self.idle,
        }
    }

    /// Intent for a register value, if it is one of the three codes.
    pub fn intent(&self, code: u16) -> Option<Intent> {
        [Intent::Fire, Intent::Rerun, Intent::Idle]
            .into_iter()
            .find(|i| self.code(*i) == code)
    }
}

/// Parse a bit pattern such as `"1000111100"`.
pub fn parse_pattern(pattern: &str) -> AppResult<Vec<bool>> {
    pattern
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(RigError::Configuration(format!(
                "Invalid character '{other}' in interlock pattern '{pattern}'"
            ))),
        })
        .collect()
}

/// Published interlock state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterlockSnapshot {
    /// Discrete inputs, `None` when the last read failed to decode
    pub inputs: Option<Vec<bool>>,
    /// Last intent acknowledged by the PLC
    pub acknowledged: Option<Intent>,
}

/// [`DevicePoller`] for the PLC.
#[derive(Debug, Clone)]
pub struct InterlockPoller {
    address: u8,
    intent_register: u16,
    input_start: u16,
    input_count: u16,
    codes: IntentCodes,
    settle: Duration,
    last_ack: Option<Intent>,
}

impl InterlockPoller {
    /// Poller configured from the interlock section.
    pub fn new(config: &InterlockConfig, settle: Duration) -> Self {
        Self {
            address: config.address,
            intent_register: config.intent_register,
            input_start: config.input_start,
            input_count: config.input_count,
            codes: IntentCodes {
                fire: config.fire_code,
                rerun: config.rerun_code,
                idle: config.idle_code,
            },
            settle,
            last_ack: None,
        }
    }

    fn exchange(&self, link: &mut dyn Link, request: Request) -> io::Result<Option<Response>> {
        let response = transact(link, &request.encode(), request.response_len(), self.settle)?;
        Ok(request.parse_response(&response))
    }
}

impl DevicePoller for InterlockPoller {
    type Command = Intent;
    type Snapshot = InterlockSnapshot;

    fn write(&mut self, link: &mut dyn Link, intent: &Intent) -> io::Result<()> {
        let code = self.codes.code(*intent);
        let request = Request::write_register(self.address, self.intent_register, code);
        match self.exchange(link, request)? {
            Some(Response::Written { value, .. }) => self.last_ack = self.codes.intent(value),
            _ => debug!(?intent, "intent write not echoed"),
        }
        Ok(())
    }

    fn poll(&mut self, link: &mut dyn Link, cache: &mut InterlockSnapshot) {
        let request = Request::read_coils(self.address, self.input_start, self.input_count);
        match self.exchange(link, request) {
            Ok(Some(Response::Coils(bits))) => cache.inputs = Some(bits),
            Ok(_) => cache.inputs = None,
            Err(e) => trace!(error = %e, "interlock read failed, keeping last value"),
        }
        cache.acknowledged = self.last_ack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_parse() {
        assert_eq!(
            parse_pattern("1000111100").unwrap(),
            vec![true, false, false, false, true, true, true, true, false, false]
        );
        assert_eq!(parse_pattern("1,0, 1").unwrap(), vec![true, false, true]);
        assert!(parse_pattern("10x").is_err());
    }

    #[test]
    fn codes_map_both_ways() {
        let codes = IntentCodes::default();
        assert_eq!(codes.code(Intent::Fire), 121);
        assert_eq!(codes.intent(63), Some(Intent::Rerun));
        assert_eq!(codes.intent(5), None);
    }
}
