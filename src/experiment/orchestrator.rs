//! Experiment orchestrator.
//!
//! A single-threaded state machine driven by a 1 Hz [`Orchestrator::tick`]. It
//! never touches a serial port: it reads the latest worker snapshots and
//! enqueues commands. All device handles are injected through [`RigDevices`],
//! so the same code runs against real workers, simulated links or
//! [`crate::hardware::mock::RecordingWorker`]s.
//!
//! # Architecture
//!
//! ```text
//! service loop ──tick / remote command──> Orchestrator
//!                                           │  reads snapshots
//!                                           │  enqueues TempCommand / FlowCommand / Intent
//!                                           ▼
//!                      temperature worker, flow worker, interlock worker, camera
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::ledger::{timestamp, ResultStore, TaskLedger, TaskRecord, TaskStatus, TrackingProfile};
use super::order::{ExperimentOrder, OrderTable, ThresholdWindow};
use super::schedule::{build_schedules, SetpointDispatcher};
use super::state::ExperimentState;
use crate::config::{MixingConfig, RigConfig, StorageConfig};
use crate::error::{AppResult, RigError};
use crate::hardware::capabilities::Camera;
use crate::hardware::flow::{Coil, FlowCommand, FlowSnapshot};
use crate::hardware::interlock::{parse_pattern, Intent, InterlockSnapshot};
use crate::hardware::temperature::{RunState, TempCommand, TemperatureSnapshot, Zone};
use crate::hardware::DeviceWorker;

/// Temperature controller worker as seen by the orchestrator.
pub type TemperatureWorker =
    dyn DeviceWorker<Command = TempCommand, Snapshot = TemperatureSnapshot>;
/// Flow controller bank worker as seen by the orchestrator.
pub type FlowWorker = dyn DeviceWorker<Command = FlowCommand, Snapshot = FlowSnapshot>;
/// PLC interlock worker as seen by the orchestrator.
pub type InterlockWorker = dyn DeviceWorker<Command = Intent, Snapshot = InterlockSnapshot>;

/// Injected collaborators.
#[derive(Clone)]
pub struct RigDevices {
    /// Dual-zone temperature controller
    pub temperature: Arc<TemperatureWorker>,
    /// Flow controller bank
    pub flow: Arc<FlowWorker>,
    /// PLC interlock
    pub interlock: Arc<InterlockWorker>,
    /// Microscope camera
    pub camera: Arc<dyn Camera>,
}

/// Orchestration parameters taken from [`RigConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Purge countdown in ticks
    pub purge_seconds: u32,
    /// Flow channels switched by purge/close/run
    pub flow_channels: Vec<u8>,
    /// Ar/H2 mixing
    pub mixing: MixingConfig,
    /// Single-gas channels
    pub direct_gases: BTreeMap<String, u8>,
    /// Completion window used when an order has none
    pub default_threshold: ThresholdWindow,
    /// Input vector that latches restart
    pub restart_pattern: Vec<bool>,
    /// Input vector that clears restart
    pub clear_pattern: Vec<bool>,
    /// Output locations
    pub storage: StorageConfig,
}

impl OrchestratorSettings {
    /// Settings from the loaded configuration.
    pub fn from_config(config: &RigConfig) -> AppResult<Self> {
        Ok(Self {
            purge_seconds: config.experiment.purge_seconds,
            flow_channels: config.flow.channels.clone(),
            mixing: config.flow.mixing.clone(),
            direct_gases: config.flow.direct_gases.clone(),
            default_threshold: ThresholdWindow {
                low: config.experiment.threshold_low,
                high: config.experiment.threshold_high,
            },
            restart_pattern: parse_pattern(&config.interlock.restart_pattern)?,
            clear_pattern: parse_pattern(&config.interlock.clear_pattern)?,
            storage: config.storage.clone(),
        })
    }
}

/// Point-in-time view for displays and logs.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OrchestratorStatus {
    /// Control state
    pub state: ExperimentState,
    /// Loaded experiment
    pub experiment_id: Option<String>,
    /// Current order number
    pub order_index: usize,
    /// Orders in the loaded table
    pub total_orders: usize,
    /// Remaining purge ticks
    pub countdown: u32,
    /// Last persisted progress, percent
    pub progress: Option<u32>,
    /// Restart request latched from the interlock
    pub restart_latched: bool,
    /// Waiting for a restart to run the next order
    pub awaiting_restart: bool,
    /// Last tick error
    pub last_error: Option<String>,
}

/// Parts of the Completing transition already carried out for the current
/// order. A retried tick skips them.
#[derive(Debug, Clone)]
struct Completion {
    video_path: String,
    image_path: String,
    end_time: String,
    result_appended: bool,
}

/// The experiment state machine.
pub struct Orchestrator {
    devices: RigDevices,
    settings: OrchestratorSettings,
    state: ExperimentState,
    table: Option<OrderTable>,
    ledger: Option<TaskLedger>,
    results: Option<ResultStore>,
    current: Option<ExperimentOrder>,
    dispatcher: SetpointDispatcher,
    temperature: TemperatureSnapshot,
    order_index: usize,
    countdown: u32,
    final_step: [bool; 2],
    progress: Option<u32>,
    restart_latched: bool,
    awaiting_restart: bool,
    run_started: Option<DateTime<Local>>,
    video_path: Option<PathBuf>,
    completion: Option<Completion>,
    last_error: Option<String>,
}

impl Orchestrator {
    /// Idle orchestrator over `devices`.
    pub fn new(devices: RigDevices, settings: OrchestratorSettings) -> Self {
        Self {
            devices,
            settings,
            state: ExperimentState::Idle,
            table: None,
            ledger: None,
            results: None,
            current: None,
            dispatcher: SetpointDispatcher::new(),
            temperature: TemperatureSnapshot::default(),
            order_index: 0,
            countdown: 0,
            final_step: [false; 2],
            progress: None,
            restart_latched: false,
            awaiting_restart: false,
            run_started: None,
            video_path: None,
            completion: None,
            last_error: None,
        }
    }

    /// Current control state.
    pub fn state(&self) -> ExperimentState {
        self.state
    }

    /// Current order number (1-based, 0 before any configuration).
    pub fn order_index(&self) -> usize {
        self.order_index
    }

    /// Orders in the loaded table.
    pub fn total_orders(&self) -> usize {
        self.table.as_ref().map_or(0, OrderTable::total_orders)
    }

    /// Task ledger of the loaded table.
    pub fn ledger(&self) -> Option<&TaskLedger> {
        self.ledger.as_ref()
    }

    /// Result table of the loaded table.
    pub fn results(&self) -> Option<&ResultStore> {
        self.results.as_ref()
    }

    /// Order being run.
    pub fn current_order(&self) -> Option<&ExperimentOrder> {
        self.current.as_ref()
    }

    /// Flow schedules of the current order.
    pub fn dispatcher(&self) -> &SetpointDispatcher {
        &self.dispatcher
    }

    /// Configuration in use.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Restart request latched from the interlock.
    pub fn restart_latched(&self) -> bool {
        self.restart_latched
    }

    /// Snapshot of the orchestrator for displays.
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            state: self.state,
            experiment_id: self.table.as_ref().map(|t| t.experiment_id().to_string()),
            order_index: self.order_index,
            total_orders: self.total_orders(),
            countdown: self.countdown,
            progress: self.progress,
            restart_latched: self.restart_latched,
            awaiting_restart: self.awaiting_restart,
            last_error: self.last_error.clone(),
        }
    }

    /// Load an order table and reset the sequence to order 1.
    ///
    /// Stops an active order first. Creates a fresh ledger (one not-started
    /// record per order), a fresh result table, and writes the tracking
    /// profile. A table that cannot be loaded marks the current record (if
    /// any) as exception and leaves the state unchanged.
    pub async fn apply_config(&mut self, path: &Path) -> AppResult<()> {
        if self.state.is_active() {
            self.stop().await?;
        }
        let table = match OrderTable::load(path) {
            Ok(table) => table,
            Err(e) => {
                self.mark_exception(&e);
                return Err(e);
            }
        };

        let storage = &self.settings.storage;
        let total = table.total_orders();
        let ledger = TaskLedger::create(
            storage.resolve(&storage.ledger_file),
            table.experiment_id(),
            total,
        )?;
        let results = ResultStore::create(&storage.resolve(&storage.results_dir), table.columns())?;
        TrackingProfile {
            config_file: path.to_path_buf(),
            order: 1,
        }
        .save(&storage.resolve(&storage.profile_file))?;

        info!(
            experiment = table.experiment_id(),
            orders = total,
            results = %results.path().display(),
            "Configuration applied"
        );
        self.table = Some(table);
        self.ledger = Some(ledger);
        self.results = Some(results);
        self.current = None;
        self.dispatcher.clear();
        self.order_index = 1;
        self.final_step = [false; 2];
        self.progress = None;
        self.awaiting_restart = false;
        self.last_error = None;
        self.state = ExperimentState::ConfigLoaded;
        Ok(())
    }

    /// Launch the current order: push temperature programs, rebuild flow
    /// schedules, open purge valves and start the purge countdown.
    ///
    /// An order that cannot be built marks its record as exception; the state
    /// does not change.
    pub fn launch(&mut self) -> AppResult<()> {
        if !self.state.can_launch() {
            return Err(RigError::invalid_state("launch", self.state));
        }
        let threshold = self.settings.default_threshold;
        let order = match self
            .table
            .as_ref()
            .map(|table| table.order(self.order_index, threshold))
        {
            None => return Err(RigError::invalid_state("launch", "no configuration")),
            Some(Err(e)) => {
                self.mark_exception(&e);
                return Err(e);
            }
            Some(Ok(order)) => order,
        };

        for zone in Zone::ALL {
            for (i, value) in order.program(zone).table_entries().into_iter().enumerate() {
                self.devices
                    .temperature
                    .enqueue(TempCommand::program_entry(zone, i, value));
            }
        }
        self.dispatcher.rebuild(build_schedules(
            &order.gases,
            &self.settings.mixing,
            &self.settings.direct_gases,
        ));
        self.switch_all(Coil::Purge, true);

        self.update_record(|r| {
            r.progress = "0%".into();
            r.status = TaskStatus::Running;
            r.start_time.clear();
            r.end_time.clear();
            r.message.clear();
        })?;

        info!(
            experiment = %order.experiment_id,
            order = order.index,
            purge_seconds = self.settings.purge_seconds,
            "Order launched, purging"
        );
        self.current = Some(order);
        self.final_step = [false; 2];
        self.progress = None;
        self.run_started = None;
        self.video_path = None;
        self.completion = None;
        self.countdown = self.settings.purge_seconds;
        self.state = ExperimentState::Cleaning;
        Ok(())
    }

    /// Stop the current order: stop recording, stop both programs, close all
    /// valves and mark the record as stopping. The configuration is kept so a
    /// later launch resumes the same order.
    pub async fn stop(&mut self) -> AppResult<()> {
        if self.table.is_none() {
            return Err(RigError::invalid_state("stop", self.state));
        }
        if let Err(e) = self.devices.camera.stop_recording().await {
            warn!(error = %e, "Failed to stop recording");
        }
        self.stop_hardware();
        self.final_step = [false; 2];
        self.awaiting_restart = false;

        let unfinished = self
            .ledger
            .as_ref()
            .and_then(|l| l.record(self.order_index))
            .is_some_and(|r| !matches!(r.status, TaskStatus::Completed | TaskStatus::Exception));
        if unfinished {
            self.update_record(|r| r.status = TaskStatus::Stopping)?;
        }

        let next = if self.state.is_active() {
            ExperimentState::Stopped
        } else {
            ExperimentState::Idle
        };
        info!(from = %self.state, to = %next, order = self.order_index, "Experiment stopped");
        self.state = next;
        Ok(())
    }

    /// Stop anything active before the process exits.
    pub async fn shutdown(&mut self) {
        if self.state.is_active() {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Stop during shutdown failed");
            }
        }
        self.devices.interlock.enqueue(Intent::Idle);
    }

    /// Advance the state machine by one tick.
    ///
    /// Errors are logged here and the state is left where it was, so the next
    /// tick retries the same transition. The interlock intent is written on
    /// every tick.
    pub async fn tick(&mut self, now: Instant) {
        self.temperature = self.devices.temperature.latest_snapshot();
        self.observe_interlock();

        let result = match self.state {
            ExperimentState::Cleaning => self.tick_cleaning(now).await,
            ExperimentState::Running => self.tick_running(now),
            ExperimentState::Completing => self.tick_completing().await,
            ExperimentState::Completed => self.tick_completed(),
            ExperimentState::Idle | ExperimentState::Stopped
                if self.awaiting_restart && self.restart_latched =>
            {
                self.advance_order()
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(state = %self.state, error = %e, "Tick failed, transition will be retried");
            self.last_error = Some(e.to_string());
        }

        self.signal_intent();
    }

    async fn tick_cleaning(&mut self, now: Instant) -> AppResult<()> {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            debug!(countdown = self.countdown, "purging");
            return Ok(());
        }

        // Set once the hardware is switched over; a retry only rewrites the record.
        let started = match self.run_started {
            Some(started) => started,
            None => self.start_programs(now).await?,
        };
        self.update_record(|r| r.start_time = started.format("%Y-%m-%d %H:%M:%S").to_string())?;
        info!(order = self.order_index, "Purge finished, programs running");
        self.state = ExperimentState::Running;
        Ok(())
    }

    async fn start_programs(&mut self, now: Instant) -> AppResult<DateTime<Local>> {
        let video = self.artifact_path(&self.settings.storage.video_dir, "mp4")?;

        self.switch_all(Coil::CloseValve, true);
        for zone in Zone::ALL {
            self.devices
                .temperature
                .enqueue(TempCommand::run_state(zone, RunState::Run));
        }
        self.switch_all(Coil::ValveControl, true);
        self.switch_all(Coil::DigitalMode, true);

        self.dispatcher.start(now);
        let due = self.dispatcher.dispatch(now);
        self.enqueue_flow(due);

        match self.devices.camera.start_recording(&video).await {
            Ok(()) => self.video_path = Some(video),
            Err(e) => warn!(error = %e, "Failed to start recording"),
        }

        let started = Local::now();
        self.run_started = Some(started);
        Ok(started)
    }

    fn tick_running(&mut self, now: Instant) -> AppResult<()> {
        let due = self.dispatcher.dispatch(now);
        self.enqueue_flow(due);

        let order = self
            .current
            .as_ref()
            .ok_or_else(|| RigError::invalid_state("run", "no current order"))?;
        let mut reached = Vec::new();
        for zone in Zone::ALL {
            let step = self.temperature.zone(zone).step;
            if !self.final_step[zone.index()] && step == Some(order.program(zone).final_step()) {
                reached.push(zone);
            }
        }
        for zone in reached {
            self.final_step[zone.index()] = true;
            info!(?zone, "Zone reached its final step");
        }

        let zone_b = self.temperature.zone(Zone::B);
        let percent = match (zone_b.step, zone_b.step_minutes) {
            (Some(1), _) if self.final_step[Zone::B.index()] => Some(100.0),
            (Some(step), Some(minutes)) => {
                Some(order.program(Zone::B).progress_percent(step, minutes))
            }
            _ => None,
        };
        // Whole percent, truncated.
        if let Some(percent) = percent.map(|p| p.trunc() as u32) {
            if self.progress != Some(percent) {
                self.update_record(|r| r.progress = format!("{percent}%"))?;
                self.progress = Some(percent);
            }
        }

        if self.completion_condition() && !self.restart_latched {
            info!(
                order = self.order_index,
                process_value = ?self.temperature.zone(Zone::B).process_value,
                "Completion condition met"
            );
            self.state = ExperimentState::Completing;
        }
        Ok(())
    }

    async fn tick_completing(&mut self) -> AppResult<()> {
        let order = self
            .current
            .clone()
            .ok_or_else(|| RigError::invalid_state("complete", "no current order"))?;

        let mut completion = match self.completion.take() {
            Some(completion) => completion,
            None => self.capture_completion(&order).await?,
        };
        if !completion.result_appended {
            if let Some(results) = &self.results {
                let date = format!("{}, {}", self.start_text(), completion.end_time);
                let appended = results.append(
                    &order.values(),
                    &completion.video_path,
                    &completion.image_path,
                    &date,
                );
                if let Err(e) = appended {
                    self.completion = Some(completion);
                    return Err(e);
                }
            }
            completion.result_appended = true;
        }

        let (video_path, image_path, end_time) = (
            completion.video_path.clone(),
            completion.image_path.clone(),
            completion.end_time.clone(),
        );
        let recorded = self.update_record(|r| {
            r.status = TaskStatus::Completed;
            r.progress = "100%".into();
            r.end_time = end_time;
            r.video_path = video_path;
            r.image_path = image_path;
        });
        if let Err(e) = recorded {
            self.completion = Some(completion);
            return Err(e);
        }

        if let Err(e) = self.devices.camera.stop_recording().await {
            warn!(error = %e, "Failed to stop recording");
        }
        self.stop_hardware();
        info!(order = order.index, "Order completed");
        self.state = ExperimentState::Completed;
        Ok(())
    }

    async fn capture_completion(&self, order: &ExperimentOrder) -> AppResult<Completion> {
        let image = self.artifact_path(&self.settings.storage.image_dir, "jpg")?;
        let process_value = self
            .temperature
            .zone(Zone::B)
            .process_value
            .map_or_else(|| "--".to_string(), |v| format!("{v:.1}"));
        let annotation = format!(
            "{} order {} PV {process_value}",
            order.experiment_id, order.index
        );
        let image_path = match self.devices.camera.capture_still(&image, &annotation).await {
            Ok(()) => image.display().to_string(),
            Err(e) => {
                warn!(error = %e, "Failed to capture still");
                String::new()
            }
        };
        Ok(Completion {
            video_path: self
                .video_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            image_path,
            end_time: timestamp(),
            result_appended: false,
        })
    }

    fn start_text(&self) -> String {
        self.run_started
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }

    fn tick_completed(&mut self) -> AppResult<()> {
        let orders_left = self.order_index < self.total_orders();
        if self.restart_latched && orders_left {
            return self.advance_order();
        }
        self.awaiting_restart = orders_left;
        info!(
            order = self.order_index,
            awaiting_restart = orders_left,
            "Sequence idle"
        );
        self.state = ExperimentState::Idle;
        Ok(())
    }

    fn advance_order(&mut self) -> AppResult<()> {
        self.order_index += 1;
        self.awaiting_restart = false;
        self.state = ExperimentState::Idle;
        if let Some(table) = &self.table {
            let profile = TrackingProfile {
                config_file: table.path().to_path_buf(),
                order: self.order_index,
            };
            let storage = &self.settings.storage;
            if let Err(e) = profile.save(&storage.resolve(&storage.profile_file)) {
                warn!(error = %e, "Failed to save tracking profile");
            }
        }
        info!(order = self.order_index, "Restart received, launching next order");
        self.launch()
    }

    fn observe_interlock(&mut self) {
        let Some(inputs) = self.devices.interlock.latest_snapshot().inputs else {
            return;
        };
        if !self.restart_latched && inputs == self.settings.restart_pattern {
            info!("Restart pattern latched");
            self.restart_latched = true;
        } else if self.restart_latched && inputs == self.settings.clear_pattern {
            info!("Restart pattern cleared");
            self.restart_latched = false;
        }
    }

    fn completion_condition(&self) -> bool {
        let Some(order) = &self.current else {
            return false;
        };
        self.final_step[Zone::B.index()]
            && self
                .temperature
                .zone(Zone::B)
                .process_value
                .is_some_and(|pv| order.threshold.contains(pv))
    }

    fn signal_intent(&self) {
        let intent = if self.completion_condition() && !self.restart_latched {
            Intent::Fire
        } else if self.restart_latched {
            Intent::Rerun
        } else {
            Intent::Idle
        };
        self.devices.interlock.enqueue(intent);
    }

    fn stop_hardware(&mut self) {
        for zone in Zone::ALL {
            self.devices
                .temperature
                .enqueue(TempCommand::run_state(zone, RunState::Stop));
        }
        self.switch_all(Coil::CloseValve, true);
        self.dispatcher.halt();
    }

    fn switch_all(&self, coil: Coil, on: bool) {
        for &channel in &self.settings.flow_channels {
            self.devices
                .flow
                .enqueue(FlowCommand::Coil { channel, coil, on });
        }
    }

    fn enqueue_flow(&self, commands: Vec<FlowCommand>) {
        for command in commands {
            self.devices.flow.enqueue(command);
        }
    }

    fn artifact_path(&self, dir: &Path, extension: &str) -> AppResult<PathBuf> {
        let order = self
            .current
            .as_ref()
            .ok_or_else(|| RigError::invalid_state("artifact", "no current order"))?;
        let name = format!(
            "{}_{}_{}.{extension}",
            order.experiment_id,
            order.index,
            Local::now().format("%Y%m%d_%H%M%S")
        );
        Ok(self.settings.storage.resolve(dir).join(name))
    }

    fn update_record(&mut self, change: impl FnOnce(&mut TaskRecord)) -> AppResult<()> {
        let index = self.order_index;
        match self.ledger.as_mut() {
            Some(ledger) => ledger.update(index, change),
            None => Ok(()),
        }
    }

    fn mark_exception(&mut self, error: &RigError) {
        warn!(order = self.order_index, error = %error, "Order marked as exception");
        let message = error.to_string();
        if let Err(e) = self.update_record(|r| {
            r.status = TaskStatus::Exception;
            r.message = message;
        }) {
            warn!(error = %e, "Failed to record exception");
        }
    }
}
