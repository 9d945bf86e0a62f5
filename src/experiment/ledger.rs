//! Persisted experiment state.
//!
//! - [`TaskLedger`]: one row per order, rewritten in full on every update
//! - [`ResultStore`]: one row appended per completed order
//! - [`TrackingProfile`]: which table is loaded and which order is current

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppResult, RigError};

/// Lifecycle of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Configured, not launched yet
    NotStarted,
    /// Purging or running
    Running,
    /// Stopped by the operator
    Stopping,
    /// Finished and persisted
    Completed,
    /// Could not be prepared or launched
    Exception,
}

impl TaskStatus {
    /// Two-digit status code reported to remote clients.
    pub fn code(self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "01",
            TaskStatus::Running => "02",
            TaskStatus::Stopping => "03",
            TaskStatus::Completed => "04",
            TaskStatus::Exception => "05",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::NotStarted => "not-started",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Completed => "completed",
            TaskStatus::Exception => "exception",
        };
        f.write_str(text)
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Experiment id (order table stem)
    pub experiment_id: String,
    /// 1-based order number
    pub task_id: usize,
    /// Progress such as `"42%"`
    pub progress: String,
    /// Status
    pub status: TaskStatus,
    /// Run start, local time
    pub start_time: String,
    /// Run end, local time
    pub end_time: String,
    /// Recorded video
    pub video_path: String,
    /// Captured still
    pub image_path: String,
    /// Error message for exception records
    #[serde(default)]
    pub message: String,
}

impl TaskRecord {
    /// Fresh, not-started record.
    pub fn new(experiment_id: &str, task_id: usize) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            task_id,
            progress: "0%".to_string(),
            status: TaskStatus::NotStarted,
            start_time: String::new(),
            end_time: String::new(),
            video_path: String::new(),
            image_path: String::new(),
            message: String::new(),
        }
    }
}

/// Local timestamp as written to the ledger.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Task ledger file.
#[derive(Debug, Clone)]
pub struct TaskLedger {
    path: PathBuf,
    records: Vec<TaskRecord>,
}

impl TaskLedger {
    /// Create a ledger with `total` not-started records and write it.
    pub fn create(path: impl Into<PathBuf>, experiment_id: &str, total: usize) -> AppResult<Self> {
        let ledger = Self {
            path: path.into(),
            records: (1..=total).map(|i| TaskRecord::new(experiment_id, i)).collect(),
        };
        ledger.save()?;
        Ok(ledger)
    }

    /// Read an existing ledger.
    pub fn load(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let mut reader = csv::Reader::from_path(&path)?;
        let records = reader.deserialize().collect::<Result<Vec<TaskRecord>, _>>()?;
        Ok(Self { path, records })
    }

    /// Ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in order.
    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    /// Record of one order.
    pub fn record(&self, task_id: usize) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.task_id == task_id)
    }

    /// Mutate one record and rewrite the file.
    pub fn update(
        &mut self,
        task_id: usize,
        change: impl FnOnce(&mut TaskRecord),
    ) -> AppResult<()> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.task_id == task_id)
            .ok_or_else(|| RigError::NotFound(format!("task {task_id}")))?;
        change(record);
        debug!(task_id, status = %record.status, progress = %record.progress, "ledger updated");
        self.save()
    }

    /// Rewrite the whole file.
    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&self.path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Extra result columns after the order's own columns.
pub const RESULT_COLUMNS: [&str; 3] = ["Video", "Image", "Date"];

/// Result table of one applied configuration.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    /// Create `result_<timestamp>.csv` in `dir` with the order columns plus
    /// [`RESULT_COLUMNS`].
    pub fn create(dir: &Path, columns: &[String]) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let name = format!("result_{}.csv", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(columns.iter().map(String::as_str).chain(RESULT_COLUMNS))?;
        writer.flush()?;
        Ok(Self { path })
    }

    /// Result file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one completed order.
    pub fn append(&self, values: &[String], video: &str, image: &str, date: &str) -> AppResult<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(values.iter().map(String::as_str).chain([video, image, date]))?;
        writer.flush()?;
        Ok(())
    }

    /// Read back all data rows.
    pub fn rows(&self) -> AppResult<Vec<Vec<String>>> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let rows = reader
            .records()
            .map(|r| r.map(|record| record.iter().map(str::to_string).collect()))
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

/// Current table and order, persisted so an operator can see where a
/// sequence stands after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingProfile {
    /// Loaded order table
    pub config_file: PathBuf,
    /// Current order number
    pub order: usize,
}

impl TrackingProfile {
    /// Read a profile.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the profile.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_rewrites_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.csv");
        let mut ledger = TaskLedger::create(&path, "exp", 3).unwrap();
        ledger
            .update(2, |r| {
                r.status = TaskStatus::Running;
                r.progress = "40%".into();
            })
            .unwrap();

        let reloaded = TaskLedger::load(&path).unwrap();
        assert_eq!(reloaded.records().len(), 3);
        assert_eq!(reloaded.record(2).unwrap().status, TaskStatus::Running);
        assert_eq!(reloaded.record(2).unwrap().progress, "40%");
        assert_eq!(reloaded.record(3).unwrap().status, TaskStatus::NotStarted);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(
            "experiment_id,task_id,progress,status,start_time,end_time,video_path,image_path"
        ));
        assert!(text.contains("not-started"));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::create(dir.path().join("l.csv"), "exp", 1).unwrap();
        assert!(matches!(ledger.update(9, |_| {}), Err(RigError::NotFound(_))));
    }

    #[test]
    fn results_append_after_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::create(dir.path(), &["Order".into(), "Substrate".into()]).unwrap();
        store
            .append(&["1".into(), "Si".into()], "v.mp4", "i.jpg", "a, b")
            .unwrap();
        let rows = store.rows().unwrap();
        assert_eq!(rows, vec![vec!["1", "Si", "v.mp4", "i.jpg", "a, b"]]);
        let header = std::fs::read_to_string(store.path()).unwrap();
        assert!(header.starts_with("Order,Substrate,Video,Image,Date"));
    }

    #[test]
    fn profile_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let profile = TrackingProfile {
            config_file: "config/exp.csv".into(),
            order: 3,
        };
        profile.save(&path).unwrap();
        assert_eq!(TrackingProfile::load(&path).unwrap(), profile);
    }
}
