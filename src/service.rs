//! Service loop: the only task that touches the orchestrator.
//!
//! One `tokio::select!` multiplexes the 1 Hz tick, remote commands and
//! shutdown. Ticks that fall behind are delayed rather than bunched up.

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{AppResult, RigError};
use crate::experiment::order::OrderTable;
use crate::experiment::Orchestrator;
use crate::messages::RemoteCommand;
use crate::remote::{artifact_path, status_report, RemoteClient};

/// Capacity of the remote command channel.
pub const COMMAND_CAPACITY: usize = 32;

/// Owns the orchestrator and drives it.
pub struct RigService {
    orchestrator: Orchestrator,
    commands: mpsc::Receiver<RemoteCommand>,
    tick_period: Duration,
}

fn reply<T>(respond_to: oneshot::Sender<T>, value: T) {
    if respond_to.send(value).is_err() {
        debug!("remote client dropped its reply channel");
    }
}

impl RigService {
    /// Service around `orchestrator` plus a client for its command channel.
    pub fn new(orchestrator: Orchestrator, tick_period: Duration) -> (Self, RemoteClient) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let service = Self {
            orchestrator,
            commands: rx,
            tick_period,
        };
        (service, RemoteClient::new(tx))
    }

    /// The orchestrator being driven.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run until `shutdown` resolves, then stop any active order and hand the
    /// orchestrator back.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Orchestrator {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut commands_open = true;

        info!(tick_ms = self.tick_period.as_millis() as u64, "Service loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                instant = ticker.tick() => {
                    self.orchestrator.tick(instant.into_std()).await;
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("all remote clients dropped");
                        commands_open = false;
                    }
                },
            }
        }

        self.orchestrator.shutdown().await;
        self.orchestrator
    }

    /// Apply one remote command.
    pub async fn handle(&mut self, command: RemoteCommand) {
        match command {
            RemoteCommand::StartExperiment { respond_to } => {
                info!("Remote start");
                let result = self.orchestrator.launch();
                if let Err(e) = &result {
                    warn!(error = %e, "Remote start rejected");
                }
                reply(respond_to, result);
            }
            RemoteCommand::StopExperiment { respond_to } => {
                info!("Remote stop");
                reply(respond_to, self.orchestrator.stop().await);
            }
            RemoteCommand::SetParameters {
                experiment_id,
                table,
                respond_to,
            } => {
                info!(experiment = %experiment_id, orders = table.len(), "Remote parameters");
                let result = self.set_parameters(&experiment_id, &table).await;
                if let Err(e) = &result {
                    warn!(experiment = %experiment_id, error = %e, "Parameters rejected");
                }
                reply(respond_to, result);
            }
            RemoteCommand::GetStatus { respond_to } => {
                let records = self
                    .orchestrator
                    .ledger()
                    .map(|l| l.records())
                    .unwrap_or_default();
                reply(respond_to, status_report(records));
            }
            RemoteCommand::DownloadArtifact {
                experiment_id,
                task_id,
                kind,
                respond_to,
            } => {
                let records = self
                    .orchestrator
                    .ledger()
                    .map(|l| l.records())
                    .unwrap_or_default();
                reply(
                    respond_to,
                    artifact_path(records, &experiment_id, task_id, kind),
                );
            }
        }
    }

    async fn set_parameters(
        &mut self,
        experiment_id: &str,
        table: &[Map<String, Value>],
    ) -> AppResult<()> {
        if experiment_id.is_empty()
            || experiment_id.contains(['/', '\\'])
            || experiment_id.starts_with('.')
        {
            return Err(RigError::Configuration(format!(
                "invalid experiment id '{experiment_id}'"
            )));
        }
        let storage = &self.orchestrator.settings().storage;
        let path = storage
            .resolve(&storage.config_dir)
            .join(format!("{experiment_id}.csv"));
        OrderTable::write_records(&path, table)?;
        self.orchestrator.apply_config(&path).await
    }
}
