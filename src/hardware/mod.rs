//! Rig hardware
//!
//! Serial devices are driven by [`worker`] threads, one per link, each pairing a
//! [`link::Link`] with a protocol-family poller:
//!
//! - [`temperature`]: dual-zone program controller
//! - [`flow`]: mass-flow controller bank
//! - [`interlock`]: PLC intent/restart link
//!
//! Optical collaborators are expressed as [`capabilities`] traits. [`mock`]
//! provides simulated devices for dry runs and tests.

pub mod capabilities;
pub mod flow;
pub mod interlock;
pub mod link;
pub mod mock;
pub mod temperature;
pub mod worker;

pub use worker::{spawn_worker, DeviceLoop, DevicePoller, DeviceWorker, WorkerHandle};
