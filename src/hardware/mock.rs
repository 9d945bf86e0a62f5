//! Mock and Simulated Hardware
//!
//! Stand-ins for every collaborator, so the whole rig can run without hardware
//! (`cvd-rig simulate`) and orchestration can be tested deterministically.
//!
//! # Available Mocks
//!
//! - [`SimLink`] - a [`Link`] whose far end is an in-process device model:
//!   - [`TemperatureModel`] - dual-zone program controller (sum-checksum frames)
//!   - [`FlowBankModel`] - bank of mass-flow controllers (CRC16 frames)
//!   - [`InterlockModel`] - PLC with an intent register and discrete inputs
//! - [`RecordingWorker`] - a [`DeviceWorker`] that records commands and serves
//!   a settable snapshot
//! - [`MockCamera`] - records recording/still calls, writes placeholder files
//! - [`SimulatedOptics`] - focus drive plus frame source with a known best focus

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array2;
use tokio::sync::RwLock;
use tracing::info;

use super::capabilities::{FocusDrive, FrameSource, Recorder, StillCapture};
use super::flow::{REG_DEVICE_ID, REG_FULL_SCALE, REG_PROCESS_VALUE, REG_SET_VALUE};
use super::link::Link;
use super::temperature::Zone;
use super::worker::DeviceWorker;
use crate::protocol::aibus::{self, Alarms};
use crate::protocol::modbus_rtu::{self, Request, Response};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// SimLink - in-process serial link
// =============================================================================

/// Far end of a simulated link.
pub trait DeviceModel: Send + 'static {
    /// Reply to one request frame, or `None` to stay silent.
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>>;
}

/// Injected link misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Device never answers (frame timeout)
    Silent,
    /// Last byte of every reply flipped (checksum failure)
    Corrupt,
    /// Port-level I/O error on every call
    IoError,
}

/// One request or read seen by a simulated link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Request frame written
    Request(Vec<u8>),
    /// Reply read, with the number of bytes returned
    Read(usize),
}

struct SimState<D> {
    device: D,
    pending: Vec<u8>,
    fault: Option<LinkFault>,
    events: Vec<LinkEvent>,
}

/// A [`Link`] backed by a [`DeviceModel`]. Clones share the same device, so a
/// test can keep one clone while the worker owns another.
pub struct SimLink<D> {
    state: Arc<Mutex<SimState<D>>>,
}

impl<D> Clone for SimLink<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<D: DeviceModel> SimLink<D> {
    /// Link to `device`.
    pub fn new(device: D) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                device,
                pending: Vec::new(),
                fault: None,
                events: Vec::new(),
            })),
        }
    }

    /// Inspect or change the device model.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut lock(&self.state).device)
    }

    /// Inject or clear a fault.
    pub fn set_fault(&self, fault: Option<LinkFault>) {
        lock(&self.state).fault = fault;
    }

    /// Requests and reads seen so far.
    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.state).events.clone()
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// Boxed clone for a device worker.
    pub fn boxed(&self) -> Box<dyn Link> {
        Box::new(self.clone())
    }
}

fn io_fault() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated link fault")
}

impl<D: DeviceModel> Link for SimLink<D> {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.fault == Some(LinkFault::IoError) {
            return Err(io_fault());
        }
        state.events.push(LinkEvent::Request(frame.to_vec()));
        let mut reply = state.device.respond(frame).unwrap_or_default();
        match state.fault {
            Some(LinkFault::Silent) => reply.clear(),
            Some(LinkFault::Corrupt) => {
                if let Some(last) = reply.last_mut() {
                    *last ^= 0xFF;
                }
            }
            _ => {}
        }
        state.pending = reply;
        Ok(())
    }

    fn read_frame(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.fault == Some(LinkFault::IoError) {
            return Err(io_fault());
        }
        let mut reply = std::mem::take(&mut state.pending);
        reply.truncate(len);
        state.events.push(LinkEvent::Read(reply.len()));
        Ok(reply)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.state).pending.clear();
        Ok(())
    }
}

// =============================================================================
// TemperatureModel
// =============================================================================

const PROGRAM_LEN: usize = (aibus::PARAM_PROGRAM_LAST - aibus::PARAM_PROGRAM_BASE) as usize + 1;
const AMBIENT: f64 = 25.0;
const LAG_MINUTES: f64 = 2.0;

/// One simulated zone. Program entries are kept in wire units (×10).
#[derive(Debug, Clone)]
pub struct SimZone {
    /// Process value, °C
    pub process_value: f64,
    /// Run state code (0 run, 1 stop, 2 hold)
    pub run_state: i16,
    /// Program step, 1-based
    pub step: i16,
    /// Minutes into the step
    pub step_minutes: f64,
    /// Output percent
    pub output: u8,
    /// Alarm flags
    pub alarms: Alarms,
    /// Program table, parameters 80..=179 in wire units
    pub program: [i16; PROGRAM_LEN],
}

impl Default for SimZone {
    fn default() -> Self {
        Self {
            process_value: AMBIENT,
            run_state: 1,
            step: 1,
            step_minutes: 0.0,
            output: 0,
            alarms: Alarms::default(),
            program: [0; PROGRAM_LEN],
        }
    }
}

impl SimZone {
    fn step_entry(&self, step: i16, offset: usize) -> Option<f64> {
        let index = usize::try_from(step - 1).ok()? * 2 + offset;
        self.program.get(index).map(|v| f64::from(*v) / 10.0)
    }

    /// Program temperature of `step`.
    pub fn step_temperature(&self, step: i16) -> Option<f64> {
        self.step_entry(step, 0)
    }

    /// Program minutes of `step`.
    pub fn step_length(&self, step: i16) -> Option<f64> {
        self.step_entry(step, 1)
    }

    /// Ramp set value: interpolate between this step's and the next step's
    /// temperature.
    pub fn set_value(&self) -> f64 {
        let start = self.step_temperature(self.step).unwrap_or(AMBIENT);
        let end = self.step_temperature(self.step + 1).unwrap_or(start);
        match self.step_length(self.step) {
            Some(length) if length > 0.0 => {
                start + (end - start) * (self.step_minutes / length).clamp(0.0, 1.0)
            }
            _ => start,
        }
    }

    /// Advance program time by `minutes`.
    pub fn advance(&mut self, minutes: f64) {
        let lag = 1.0 - (-minutes / LAG_MINUTES).exp();
        if self.run_state != 0 {
            self.process_value += (AMBIENT - self.process_value) * lag;
            return;
        }
        self.step_minutes += minutes;
        loop {
            match self.step_length(self.step) {
                Some(length) if length < 0.0 => {
                    // End marker: the program stops and rewinds.
                    self.run_state = 1;
                    self.step = 1;
                    self.step_minutes = 0.0;
                    break;
                }
                Some(length) if self.step_minutes >= length => {
                    self.step_minutes -= length;
                    self.step += 1;
                }
                Some(_) => break,
                None => {
                    self.run_state = 1;
                    break;
                }
            }
        }
        let target = self.set_value();
        self.process_value += (target - self.process_value) * lag;
        self.output = ((target - self.process_value).abs().min(100.0)) as u8;
    }
}

/// Dual-zone program controller. Device address 1 is zone A, 2 is zone B.
#[derive(Debug, Clone, Default)]
pub struct TemperatureModel {
    zones: [SimZone; 2],
    speedup: f64,
    last_update: Option<Instant>,
}

impl TemperatureModel {
    /// Controller whose program time only moves through [`Self::advance`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller whose program time follows the wall clock, `speedup` times
    /// faster.
    pub fn with_speedup(speedup: f64) -> Self {
        Self {
            speedup,
            ..Self::default()
        }
    }

    /// Zone state.
    pub fn zone(&self, zone: Zone) -> &SimZone {
        &self.zones[zone.index()]
    }

    /// Mutable zone state.
    pub fn zone_mut(&mut self, zone: Zone) -> &mut SimZone {
        &mut self.zones[zone.index()]
    }

    /// Advance both zones by `minutes` of program time.
    pub fn advance(&mut self, minutes: f64) {
        for zone in self.zones.iter_mut() {
            zone.advance(minutes);
        }
    }

    fn follow_clock(&mut self) {
        if self.speedup <= 0.0 {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_update {
            let minutes = (now - last).as_secs_f64() / 60.0 * self.speedup;
            self.advance(minutes);
        }
        self.last_update = Some(now);
    }
}

impl DeviceModel for TemperatureModel {
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let request = aibus::decode_request(request)?;
        let zone = Zone::ALL.into_iter().find(|z| z.address() == request.dev)?;
        self.follow_clock();
        let state = &mut self.zones[zone.index()];

        if request.opcode == aibus::WRITE_OPCODE {
            match request.param {
                aibus::PARAM_RUN_STATE => {
                    if request.value == 0 && state.run_state == 1 {
                        state.step = 1;
                        state.step_minutes = 0.0;
                    }
                    state.run_state = request.value;
                }
                aibus::PARAM_STEP => state.step = request.value.max(1),
                p if p >= aibus::PARAM_PROGRAM_BASE => {
                    let index = usize::from(p - aibus::PARAM_PROGRAM_BASE);
                    if let Some(slot) = state.program.get_mut(index) {
                        *slot = request.value;
                    }
                }
                _ => {}
            }
        }

        let fixed = |v: f64| (v * 10.0).round() as i16;
        let param_word = match request.param {
            aibus::PARAM_PROCESS_VALUE => fixed(state.process_value),
            aibus::PARAM_SET_VALUE => fixed(state.set_value()),
            aibus::PARAM_STEP => state.step,
            aibus::PARAM_STEP_TIME => fixed(state.step_minutes),
            aibus::PARAM_RUN_STATE => state.run_state,
            p if p >= aibus::PARAM_PROGRAM_BASE => state
                .program
                .get(usize::from(p - aibus::PARAM_PROGRAM_BASE))
                .copied()
                .unwrap_or(0),
            _ => 0,
        };
        Some(
            aibus::encode_response(
                request.dev,
                state.process_value,
                state.set_value(),
                state.output,
                state.alarms,
                param_word,
            )
            .to_vec(),
        )
    }
}

/// Simulated temperature controller link.
pub type SimulatedController = SimLink<TemperatureModel>;

// =============================================================================
// FlowBankModel
// =============================================================================

/// One simulated flow controller.
#[derive(Debug, Clone)]
pub struct SimMfc {
    /// Full scale register
    pub full_scale: u16,
    /// Set value in raw counts
    pub set_raw: u16,
    /// Coils 0..8
    pub coils: [bool; 8],
}

impl SimMfc {
    /// Closed, digital-mode controller.
    pub fn new(full_scale: u16) -> Self {
        let mut coils = [false; 8];
        coils[0] = true;
        coils[3] = true;
        Self {
            full_scale,
            set_raw: 0,
            coils,
        }
    }

    /// Process value implied by the valve state.
    pub fn process_raw(&self) -> u16 {
        if self.coils[2] {
            4095
        } else if self.coils[0] || !self.coils[1] {
            0
        } else {
            self.set_raw
        }
    }
}

/// A bank of flow controllers keyed by address.
#[derive(Debug, Clone, Default)]
pub struct FlowBankModel {
    /// Controllers by address
    pub channels: BTreeMap<u8, SimMfc>,
}

impl FlowBankModel {
    /// Bank with one controller of `full_scale` at each address.
    pub fn with_channels(addresses: impl IntoIterator<Item = u8>, full_scale: u16) -> Self {
        Self {
            channels: addresses
                .into_iter()
                .map(|a| (a, SimMfc::new(full_scale)))
                .collect(),
        }
    }
}

impl DeviceModel for FlowBankModel {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = modbus_rtu::decode_request(frame)?;
        let mfc = self.channels.get_mut(&request.address)?;
        let response = match request.function {
            modbus_rtu::READ_HOLDING_REGISTERS => {
                let words = (request.start..request.start.saturating_add(request.value))
                    .map(|register| match register {
                        REG_PROCESS_VALUE => mfc.process_raw(),
                        REG_SET_VALUE => mfc.set_raw,
                        REG_FULL_SCALE => mfc.full_scale,
                        REG_DEVICE_ID => u16::from(request.address),
                        _ => 0,
                    })
                    .collect();
                Response::Registers(words)
            }
            modbus_rtu::READ_COILS => {
                let bits = (request.start..request.start.saturating_add(request.value))
                    .map(|c| mfc.coils.get(usize::from(c)).copied().unwrap_or(false))
                    .collect();
                Response::Coils(bits)
            }
            modbus_rtu::WRITE_SINGLE_COIL => {
                let on = request.value == 0xFF00;
                let coil = usize::from(request.start);
                // Close, control and purge are one exclusive switch.
                if on && coil < 3 {
                    mfc.coils[..3].iter_mut().for_each(|c| *c = false);
                }
                if let Some(slot) = mfc.coils.get_mut(coil) {
                    *slot = on;
                }
                Response::Written {
                    start: request.start,
                    value: request.value,
                }
            }
            modbus_rtu::WRITE_SINGLE_REGISTER => {
                if request.start == 17 {
                    mfc.set_raw = request.value.min(4095);
                }
                Response::Written {
                    start: request.start,
                    value: request.value,
                }
            }
            _ => return None,
        };
        Some(modbus_rtu::encode_response(&request, &response))
    }
}

/// Simulated flow controller bank link.
pub type SimulatedFlowBank = SimLink<FlowBankModel>;

// =============================================================================
// InterlockModel
// =============================================================================

/// PLC with one intent register and a discrete-input vector.
#[derive(Debug, Clone, Default)]
pub struct InterlockModel {
    /// Device address
    pub address: u8,
    /// Current intent register value
    pub register: u16,
    /// Discrete inputs
    pub inputs: Vec<bool>,
    /// Every value written to the register
    pub history: Vec<u16>,
}

impl InterlockModel {
    /// PLC at `address` with `width` inputs, all off.
    pub fn new(address: u8, width: usize) -> Self {
        Self {
            address,
            inputs: vec![false; width],
            ..Default::default()
        }
    }
}

impl DeviceModel for InterlockModel {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let request: Request = modbus_rtu::decode_request(frame)?;
        if request.address != self.address {
            return None;
        }
        let response = match request.function {
            modbus_rtu::WRITE_SINGLE_REGISTER => {
                self.register = request.value;
                self.history.push(request.value);
                Response::Written {
                    start: request.start,
                    value: request.value,
                }
            }
            modbus_rtu::READ_COILS => Response::Coils(
                (0..request.value)
                    .map(|i| {
                        let index = usize::from(request.start.saturating_add(i));
                        self.inputs.get(index).copied().unwrap_or(false)
                    })
                    .collect(),
            ),
            _ => return None,
        };
        Some(modbus_rtu::encode_response(&request, &response))
    }
}

/// Simulated PLC link.
pub type SimulatedInterlock = SimLink<InterlockModel>;

// =============================================================================
// RecordingWorker - DeviceWorker without a thread
// =============================================================================

/// A [`DeviceWorker`] that stores commands and serves whatever snapshot the
/// test sets.
pub struct RecordingWorker<C, S> {
    commands: Mutex<Vec<C>>,
    snapshot: Mutex<S>,
}

impl<C, S: Default> Default for RecordingWorker<C, S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<C, S> RecordingWorker<C, S> {
    /// Worker serving `snapshot`.
    pub fn new(snapshot: S) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Replace the served snapshot.
    pub fn set_snapshot(&self, snapshot: S) {
        *lock(&self.snapshot) = snapshot;
    }

    /// Mutate the served snapshot in place.
    pub fn update_snapshot(&self, f: impl FnOnce(&mut S)) {
        f(&mut lock(&self.snapshot));
    }

    /// Drain the recorded commands.
    pub fn take_commands(&self) -> Vec<C> {
        std::mem::take(&mut *lock(&self.commands))
    }
}

impl<C, S> DeviceWorker for RecordingWorker<C, S>
where
    C: Send,
    S: Clone + Send,
{
    type Command = C;
    type Snapshot = S;

    fn enqueue(&self, command: C) {
        lock(&self.commands).push(command);
    }

    fn latest_snapshot(&self) -> S {
        lock(&self.snapshot).clone()
    }

    fn stop(&self) {}
}

// =============================================================================
// MockCamera
// =============================================================================

/// Calls seen by [`MockCamera`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    /// Recording started to a path
    StartRecording(PathBuf),
    /// Recording stopped
    StopRecording,
    /// Still captured to a path with an annotation
    Still(PathBuf, String),
}

/// Camera that records calls and writes small placeholder files, so artifact
/// paths recorded in the ledger point at real files.
#[derive(Debug, Default)]
pub struct MockCamera {
    events: Mutex<Vec<CameraEvent>>,
}

impl MockCamera {
    /// New camera with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls seen so far.
    pub fn events(&self) -> Vec<CameraEvent> {
        lock(&self.events).clone()
    }
}

async fn write_placeholder(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl Recorder for MockCamera {
    async fn start_recording(&self, path: &Path) -> Result<()> {
        write_placeholder(path, b"").await?;
        info!(path = %path.display(), "MockCamera: recording started");
        lock(&self.events).push(CameraEvent::StartRecording(path.to_path_buf()));
        Ok(())
    }

    async fn stop_recording(&self) -> Result<()> {
        info!("MockCamera: recording stopped");
        lock(&self.events).push(CameraEvent::StopRecording);
        Ok(())
    }
}

#[async_trait]
impl StillCapture for MockCamera {
    async fn capture_still(&self, path: &Path, annotation: &str) -> Result<()> {
        write_placeholder(path, annotation.as_bytes()).await?;
        info!(path = %path.display(), annotation, "MockCamera: still captured");
        lock(&self.events).push(CameraEvent::Still(path.to_path_buf(), annotation.to_string()));
        Ok(())
    }
}

// =============================================================================
// SimulatedOptics - focus drive + frame source
// =============================================================================

/// Focus drive and camera sharing one optical path. Frames are a checkerboard
/// whose contrast falls off as a Gaussian of the distance from `best_focus`.
pub struct SimulatedOptics {
    position: RwLock<f64>,
    best_focus: f64,
    depth_of_field: f64,
    size: usize,
}

impl SimulatedOptics {
    /// Optics at position 0 with the given best focus and depth of field.
    pub fn new(best_focus: f64, depth_of_field: f64) -> Self {
        Self {
            position: RwLock::new(0.0),
            best_focus,
            depth_of_field,
            size: 32,
        }
    }
}

#[async_trait]
impl FocusDrive for SimulatedOptics {
    async fn move_rel(&self, distance: f64) -> Result<()> {
        *self.position.write().await += distance;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }
}

#[async_trait]
impl FrameSource for SimulatedOptics {
    async fn grab_frame(&self) -> Result<Array2<f64>> {
        let offset = *self.position.read().await - self.best_focus;
        let contrast = (-offset * offset / (2.0 * self.depth_of_field.powi(2))).exp();
        Ok(Array2::from_shape_fn((self.size, self.size), |(r, c)| {
            let light = ((r / 4) + (c / 4)) % 2 == 0;
            128.0 + if light { 100.0 } else { -100.0 } * contrast
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::link::transact;
    use std::time::Duration;

    #[test]
    fn temperature_model_runs_program_to_end_marker() {
        let mut model = TemperatureModel::new();
        let zone = model.zone_mut(Zone::B);
        // 100°C for 10 min, 200°C for 10 min, end
        zone.program[..6].copy_from_slice(&[1000, 100, 2000, 100, 2000, -1210]);
        zone.run_state = 0;
        model.advance(15.0);
        assert_eq!(model.zone(Zone::B).step, 2);
        assert!((model.zone(Zone::B).step_minutes - 5.0).abs() < 1e-9);
        model.advance(10.0);
        assert_eq!(model.zone(Zone::B).run_state, 1);
        assert_eq!(model.zone(Zone::B).step, 1);
    }

    #[test]
    fn flow_bank_answers_register_reads() {
        let link = SimulatedFlowBank::new(FlowBankModel::with_channels([4], 500));
        let mut io = link.clone();
        let mut read = |register| {
            let request = Request::read_registers(4, register, 1);
            let reply = transact(&mut io, &request.encode(), request.response_len(), Duration::ZERO)
                .unwrap();
            request.parse_register(&reply)
        };
        assert_eq!(read(REG_FULL_SCALE), Some(500));
        assert_eq!(read(REG_DEVICE_ID), Some(4));
    }

    #[test]
    fn silent_fault_returns_empty_reply() {
        let link = SimulatedFlowBank::new(FlowBankModel::with_channels([1], 100));
        link.set_fault(Some(LinkFault::Silent));
        let mut io = link.clone();
        let request = Request::read_registers(1, 16, 1);
        let reply = transact(&mut io, &request.encode(), 7, Duration::ZERO).unwrap();
        assert!(reply.is_empty());
    }
}
