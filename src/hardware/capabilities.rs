//! Capabilities of the optical collaborators.
//!
//! The microscope camera SDK and the focus drive live outside this crate. The
//! orchestrator and the focus search only see these small traits:
//!
//! - [`Recorder`]: start/stop a video file for the running order
//! - [`StillCapture`]: save one annotated still when an order completes
//! - [`FrameSource`]: grab a grayscale frame for sharpness scoring
//! - [`FocusDrive`]: relative moves of the focus mechanism
//!
//! # Design
//!
//! Each capability trait is async (`#[async_trait]`), `Send + Sync`, and returns
//! `anyhow::Result` so SDK errors pass through with context.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array2;

/// Capability: video recording.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Start writing video to `path`.
    async fn start_recording(&self, path: &Path) -> Result<()>;

    /// Finish the current video. A no-op when nothing is recording.
    async fn stop_recording(&self) -> Result<()>;
}

/// Capability: still capture.
#[async_trait]
pub trait StillCapture: Send + Sync {
    /// Save one still to `path`, drawing `annotation` onto it.
    async fn capture_still(&self, path: &Path, annotation: &str) -> Result<()>;
}

/// Capability: raw frames for image analysis.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Grab one grayscale frame, row-major, intensity as `f64`.
    async fn grab_frame(&self) -> Result<Array2<f64>>;
}

/// Capability: focus motion.
///
/// Positions are in drive units. `move_rel` returns after motion completes.
#[async_trait]
pub trait FocusDrive: Send + Sync {
    /// Move by `distance` from the current position.
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Current position.
    async fn position(&self) -> Result<f64>;
}

/// Combined trait for the orchestrator's camera (trait objects need one trait).
pub trait Camera: Recorder + StillCapture {}

impl<T: Recorder + StillCapture> Camera for T {}
