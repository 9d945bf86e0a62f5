//! Experiment sequencing.
//!
//! - [`order`]: order tables and the per-order programs built from them
//! - [`schedule`]: flow setpoint schedules and their dispatcher
//! - [`ledger`]: task ledger, result table and tracking profile
//! - [`state`]: orchestrator control states
//! - [`orchestrator`]: the 1 Hz state machine tying the devices together

pub mod ledger;
pub mod orchestrator;
pub mod order;
pub mod schedule;
pub mod state;

pub use ledger::{ResultStore, TaskLedger, TaskRecord, TaskStatus, TrackingProfile};
pub use orchestrator::{Orchestrator, OrchestratorSettings, OrchestratorStatus, RigDevices};
pub use order::{ExperimentOrder, OrderTable, Program, ThresholdWindow};
pub use schedule::{build_schedules, Schedule, SetpointDispatcher};
pub use state::ExperimentState;
