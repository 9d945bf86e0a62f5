//! Remote control messages.
//!
//! Commands reach the service loop over a `tokio::sync::mpsc` channel and each
//! carries a `oneshot::Sender` for its reply, so the orchestrator is only ever
//! touched from the service task.
//!
//! ```text
//! client                               service loop
//! ------                               ------------
//! 1. build command + oneshot
//! 2. send over mpsc          ------>
//!                                      3. apply to orchestrator
//!                                      4. reply on oneshot
//! 5. await receiver          <------
//! ```
//!
//! Every variant has a helper that returns the command together with its
//! receiver:
//!
//! ```rust
//! use cvd_rig::messages::RemoteCommand;
//!
//! let (cmd, rx) = RemoteCommand::get_status();
//! // cmd_tx.send(cmd).await?;
//! // let report = rx.await?;
//! # drop((cmd, rx));
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::AppResult;
use crate::remote::StatusReport;

/// Kind of artifact a client can download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Video recorded while the order ran
    Video,
    /// Still captured at completion
    Image,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Video => f.write_str("video"),
            ArtifactKind::Image => f.write_str("image"),
        }
    }
}

/// Commands accepted by the service loop.
#[derive(Debug)]
pub enum RemoteCommand {
    /// Launch the current order of the loaded table.
    StartExperiment {
        /// Launch result
        respond_to: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the running order.
    StopExperiment {
        /// Stop result
        respond_to: oneshot::Sender<AppResult<()>>,
    },

    /// Store an order table and apply it.
    ///
    /// The records are written as `<config_dir>/<experiment_id>.csv`, which
    /// becomes the experiment id of the loaded table.
    SetParameters {
        /// Experiment id
        experiment_id: String,
        /// One JSON object per order
        table: Vec<Map<String, Value>>,
        /// Apply result
        respond_to: oneshot::Sender<AppResult<()>>,
    },

    /// Report the task ledger.
    GetStatus {
        /// Aggregated ledger
        respond_to: oneshot::Sender<StatusReport>,
    },

    /// Locate an order's recorded artifact.
    DownloadArtifact {
        /// Experiment id
        experiment_id: String,
        /// 1-based order number
        task_id: usize,
        /// Video or still
        kind: ArtifactKind,
        /// Artifact path, or `NotFound`
        respond_to: oneshot::Sender<AppResult<PathBuf>>,
    },
}

impl RemoteCommand {
    /// Helper for [`RemoteCommand::StartExperiment`].
    pub fn start_experiment() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartExperiment { respond_to: tx }, rx)
    }

    /// Helper for [`RemoteCommand::StopExperiment`].
    pub fn stop_experiment() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopExperiment { respond_to: tx }, rx)
    }

    /// Helper for [`RemoteCommand::SetParameters`].
    pub fn set_parameters(
        experiment_id: impl Into<String>,
        table: Vec<Map<String, Value>>,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Self::SetParameters {
            experiment_id: experiment_id.into(),
            table,
            respond_to: tx,
        };
        (cmd, rx)
    }

    /// Helper for [`RemoteCommand::GetStatus`].
    pub fn get_status() -> (Self, oneshot::Receiver<StatusReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { respond_to: tx }, rx)
    }

    /// Helper for [`RemoteCommand::DownloadArtifact`].
    pub fn download_artifact(
        experiment_id: impl Into<String>,
        task_id: usize,
        kind: ArtifactKind,
    ) -> (Self, oneshot::Receiver<AppResult<PathBuf>>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Self::DownloadArtifact {
            experiment_id: experiment_id.into(),
            task_id,
            kind,
            respond_to: tx,
        };
        (cmd, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_returns_matching_receiver() {
        let (cmd, rx) = RemoteCommand::download_artifact("exp", 2, ArtifactKind::Image);
        match cmd {
            RemoteCommand::DownloadArtifact {
                experiment_id,
                task_id,
                kind,
                respond_to,
            } => {
                assert_eq!(experiment_id, "exp");
                assert_eq!(task_id, 2);
                assert_eq!(kind, ArtifactKind::Image);
                respond_to.send(Ok(PathBuf::from("a.jpg"))).unwrap();
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), PathBuf::from("a.jpg"));
    }
}
