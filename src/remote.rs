//! Remote status reporting and the client side of the command channel.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::error::{AppResult, RigError};
use crate::experiment::ledger::{TaskRecord, TaskStatus};
use crate::messages::{ArtifactKind, RemoteCommand};

/// All orders completed.
pub const STATUS_COMPLETE: u16 = 200;
/// Some orders not completed yet.
pub const STATUS_IN_PROGRESS: u16 = 201;
/// At least one order failed.
pub const STATUS_EXCEPTION: u16 = 500;

/// One ledger row as reported to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    /// Experiment id
    pub experiment_id: String,
    /// 1-based order number
    pub task_id: usize,
    /// Progress such as `"42%"`
    pub progress: String,
    /// Two-digit status code
    pub status: String,
    /// Run start
    pub start_time: String,
    /// Run end
    pub end_time: String,
}

impl From<&TaskRecord> for TaskStatusEntry {
    fn from(record: &TaskRecord) -> Self {
        // A record never started reports "not started" whatever its status says.
        let status = if record.start_time.is_empty() && record.status != TaskStatus::Exception {
            TaskStatus::NotStarted
        } else {
            record.status
        };
        Self {
            experiment_id: record.experiment_id.clone(),
            task_id: record.task_id,
            progress: record.progress.clone(),
            status: status.code().to_string(),
            start_time: record.start_time.clone(),
            end_time: record.end_time.clone(),
        }
    }
}

/// Aggregated ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// 200, 201 or 500
    pub code: u16,
    /// Human readable summary
    pub message: String,
    /// One entry per order
    pub data: Vec<TaskStatusEntry>,
}

/// Aggregate ledger records into a [`StatusReport`].
///
/// 500 if any record is an exception, else 201 if any order is not completed,
/// else 200. An empty ledger reports 201.
pub fn status_report(records: &[TaskRecord]) -> StatusReport {
    let data: Vec<TaskStatusEntry> = records.iter().map(TaskStatusEntry::from).collect();
    let (code, message) = if records.iter().any(|r| r.status == TaskStatus::Exception) {
        (STATUS_EXCEPTION, "Experiment exception")
    } else if records.is_empty() || records.iter().any(|r| r.status != TaskStatus::Completed) {
        (STATUS_IN_PROGRESS, "Experiment in progress")
    } else {
        (STATUS_COMPLETE, "Experiment complete")
    };
    StatusReport {
        code,
        message: message.to_string(),
        data,
    }
}

/// Path of an order's artifact as recorded in the ledger.
pub fn artifact_path(
    records: &[TaskRecord],
    experiment_id: &str,
    task_id: usize,
    kind: ArtifactKind,
) -> AppResult<PathBuf> {
    let record = records
        .iter()
        .find(|r| r.experiment_id == experiment_id && r.task_id == task_id)
        .ok_or_else(|| RigError::NotFound(format!("{experiment_id} task {task_id}")))?;
    let path = match kind {
        ArtifactKind::Video => &record.video_path,
        ArtifactKind::Image => &record.image_path,
    };
    if path.is_empty() {
        return Err(RigError::NotFound(format!(
            "{kind} of {experiment_id} task {task_id}"
        )));
    }
    Ok(PathBuf::from(path))
}

/// Cloneable sender side of the service's command channel.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    sender: mpsc::Sender<RemoteCommand>,
}

impl RemoteClient {
    /// Wrap a command sender.
    pub fn new(sender: mpsc::Sender<RemoteCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(&self, (cmd, rx): (RemoteCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RigError::ChannelClosed("service command channel".into()))?;
        rx.await
            .map_err(|_| RigError::ChannelClosed("service reply".into()))
    }

    /// Launch the current order.
    pub async fn start_experiment(&self) -> AppResult<()> {
        self.request(RemoteCommand::start_experiment()).await?
    }

    /// Stop the running order.
    pub async fn stop_experiment(&self) -> AppResult<()> {
        self.request(RemoteCommand::stop_experiment()).await?
    }

    /// Store and apply an order table.
    pub async fn set_parameters(
        &self,
        experiment_id: &str,
        table: Vec<Map<String, Value>>,
    ) -> AppResult<()> {
        self.request(RemoteCommand::set_parameters(experiment_id, table))
            .await?
    }

    /// Ledger report.
    pub async fn get_status(&self) -> AppResult<StatusReport> {
        self.request(RemoteCommand::get_status()).await
    }

    /// Locate an artifact.
    pub async fn download_artifact(
        &self,
        experiment_id: &str,
        task_id: usize,
        kind: ArtifactKind,
    ) -> AppResult<PathBuf> {
        self.request(RemoteCommand::download_artifact(experiment_id, task_id, kind))
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: usize, status: TaskStatus, started: bool) -> TaskRecord {
        let mut r = TaskRecord::new("exp", task_id);
        r.status = status;
        if started {
            r.start_time = "2024-01-01 10:00:00".into();
        }
        r
    }

    #[test]
    fn unstarted_records_report_not_started() {
        let entry = TaskStatusEntry::from(&record(1, TaskStatus::Stopping, false));
        assert_eq!(entry.status, "01");
        let entry = TaskStatusEntry::from(&record(1, TaskStatus::Running, true));
        assert_eq!(entry.status, "02");
    }

    #[test]
    fn artifact_must_be_recorded() {
        let mut done = record(1, TaskStatus::Completed, true);
        done.video_path = "data/video/exp_1.mp4".into();
        let records = vec![done];
        assert_eq!(
            artifact_path(&records, "exp", 1, ArtifactKind::Video).unwrap(),
            PathBuf::from("data/video/exp_1.mp4")
        );
        assert!(matches!(
            artifact_path(&records, "exp", 1, ArtifactKind::Image),
            Err(RigError::NotFound(_))
        ));
        assert!(artifact_path(&records, "other", 1, ArtifactKind::Video).is_err());
    }
}
