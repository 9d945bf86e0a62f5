//! Remote control through the service's command channel.

use std::sync::Arc;
use std::time::Duration;

use cvd_rig::config::RigConfig;
use cvd_rig::experiment::ledger::{TaskRecord, TaskStatus};
use cvd_rig::experiment::{ExperimentState, Orchestrator, OrchestratorSettings, RigDevices};
use cvd_rig::hardware::flow::{FlowCommand, FlowSnapshot};
use cvd_rig::hardware::interlock::{Intent, InterlockSnapshot};
use cvd_rig::hardware::mock::{MockCamera, RecordingWorker};
use cvd_rig::hardware::temperature::{TempCommand, TemperatureSnapshot};
use cvd_rig::messages::ArtifactKind;
use cvd_rig::remote::{status_report, STATUS_COMPLETE, STATUS_EXCEPTION, STATUS_IN_PROGRESS};
use cvd_rig::service::RigService;
use cvd_rig::RigError;
use serde_json::{json, Map, Value};

fn orchestrator(data_dir: &std::path::Path) -> Orchestrator {
    let mut config = RigConfig::default();
    config.storage = config.storage.rooted_at(data_dir);
    config.experiment.purge_seconds = 2;
    let devices = RigDevices {
        temperature: Arc::new(RecordingWorker::<TempCommand, TemperatureSnapshot>::default()),
        flow: Arc::new(RecordingWorker::<FlowCommand, FlowSnapshot>::default()),
        interlock: Arc::new(RecordingWorker::<Intent, InterlockSnapshot>::default()),
        camera: Arc::new(MockCamera::new()),
    };
    Orchestrator::new(devices, OrchestratorSettings::from_config(&config).unwrap())
}

fn row(order: u32) -> Map<String, Value> {
    let value = json!({
        "Order": order,
        "A_step1_temperature": 400, "A_step1_time": 20,
        "B_step1_temperature": 750, "B_step1_time": 30,
        "CH4_step1_time": "00:00:00", "CH4_step1_flow": 5,
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn ledger_record(task_id: usize, status: TaskStatus) -> TaskRecord {
    let mut record = TaskRecord::new("exp", task_id);
    record.status = status;
    record.start_time = "2024-05-01 09:00:00".into();
    record
}

#[test]
fn test_status_codes_aggregate_the_ledger() {
    let done = vec![
        ledger_record(1, TaskStatus::Completed),
        ledger_record(2, TaskStatus::Completed),
    ];
    assert_eq!(status_report(&done).code, STATUS_COMPLETE);

    let partial = vec![
        ledger_record(1, TaskStatus::Completed),
        ledger_record(2, TaskStatus::Running),
    ];
    assert_eq!(status_report(&partial).code, STATUS_IN_PROGRESS);

    let failed = vec![
        ledger_record(1, TaskStatus::Exception),
        ledger_record(2, TaskStatus::Running),
    ];
    let report = status_report(&failed);
    assert_eq!(report.code, STATUS_EXCEPTION);
    assert_eq!(report.data[0].status, TaskStatus::Exception.code());

    assert_eq!(status_report(&[]).code, STATUS_IN_PROGRESS);
}

#[tokio::test]
async fn test_client_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (service, client) = RigService::new(orchestrator(dir.path()), Duration::from_millis(20));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(service.run(async {
        let _ = stop_rx.await;
    }));

    let empty = client.get_status().await.unwrap();
    assert_eq!(empty.code, STATUS_IN_PROGRESS);
    assert!(empty.data.is_empty());

    assert!(matches!(
        client.start_experiment().await,
        Err(RigError::InvalidState { .. })
    ));

    client
        .set_parameters("run07", vec![row(1), row(2), row(3)])
        .await
        .unwrap();
    let report = client.get_status().await.unwrap();
    assert_eq!(report.data.len(), 3);
    assert!(report.data.iter().all(|e| e.status == "01" && e.experiment_id == "run07"));
    assert!(dir.path().join("config").join("run07.csv").exists());

    client.start_experiment().await.unwrap();
    client.stop_experiment().await.unwrap();

    assert!(matches!(
        client.download_artifact("run07", 1, ArtifactKind::Image).await,
        Err(RigError::NotFound(_))
    ));
    assert!(matches!(
        client.download_artifact("other", 1, ArtifactKind::Video).await,
        Err(RigError::NotFound(_))
    ));

    stop_tx.send(()).unwrap();
    let orchestrator = handle.await.unwrap();
    assert_eq!(orchestrator.state(), ExperimentState::Stopped);
    assert_eq!(orchestrator.ledger().unwrap().record(1).unwrap().status, TaskStatus::Stopping);

    assert!(matches!(
        client.get_status().await,
        Err(RigError::ChannelClosed(_))
    ));
}
