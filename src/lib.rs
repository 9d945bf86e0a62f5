//! # CVD Rig Core Library
//!
//! Device communication and experiment orchestration for a chemical vapor
//! deposition rig: a dual-zone furnace controller, a bank of mass flow
//! controllers and a PLC interlock on three serial links, plus the microscope
//! camera and focus drive.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Frame codecs. `modbus_rtu` (CRC-16) for the flow bank and
//!   interlock, `aibus` (16-bit sum checksum) for the furnace controller.
//! - **`hardware`**: Serial links, the per-device worker thread, the three
//!   protocol pollers, camera/focus capabilities and simulated devices.
//! - **`experiment`**: Order tables, flow setpoint schedules, the task ledger
//!   and the orchestrator state machine.
//! - **`focus`**: Sharpness scoring and the Gaussian peak fit behind autofocus.
//! - **`messages`** / **`remote`**: Remote control commands and status reports.
//! - **`service`**: The tick/command loop that owns the orchestrator.
//! - **`config`**: Layered configuration (`figment`: TOML + environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `RigError` type.

pub mod config;
pub mod error;
pub mod experiment;
pub mod focus;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod protocol;
pub mod remote;
pub mod service;

pub use error::{AppResult, RigError};
