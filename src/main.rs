//! CLI entry point for the CVD rig.
//!
//! ```bash
//! cvd-rig run --order-table config/exp01.csv     # real serial ports
//! cvd-rig simulate --speedup 60                   # simulated devices
//! cvd-rig status                                  # ledger as a status report
//! cvd-rig focus --best-focus 6                    # autofocus on simulated optics
//! cvd-rig default-config > config/rig.toml
//! ```
//!
//! While running, stdin accepts `start`, `stop`, `status`, `load <csv>` and
//! `quit`; `restart` and `clear` drive the simulated PLC inputs. Closing stdin
//! leaves the service running until ctrl-c.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};

use cvd_rig::config::{RigConfig, DEFAULT_CONFIG_PATH};
use cvd_rig::experiment::ledger::TaskLedger;
use cvd_rig::experiment::{Orchestrator, OrchestratorSettings, RigDevices};
use cvd_rig::focus::{focus_search, FocusScan};
use cvd_rig::hardware::flow::FlowPoller;
use cvd_rig::hardware::interlock::{parse_pattern, InterlockPoller};
use cvd_rig::hardware::link::Link;
use cvd_rig::hardware::mock::{
    FlowBankModel, InterlockModel, MockCamera, SimLink, SimulatedInterlock, SimulatedOptics,
    TemperatureModel,
};
use cvd_rig::hardware::temperature::{AibusTiming, TemperaturePoller};
use cvd_rig::hardware::{spawn_worker, DeviceLoop, DeviceWorker};
use cvd_rig::logging;
use cvd_rig::remote::{status_report, RemoteClient};
use cvd_rig::service::RigService;

/// Full scale of every simulated flow controller.
const SIM_FULL_SCALE: u16 = 500;

#[derive(Parser)]
#[command(name = "cvd-rig")]
#[command(about = "CVD rig device communication and experiment orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the rig over the configured serial ports
    Run {
        /// Order table to apply at startup
        #[arg(long)]
        order_table: Option<PathBuf>,
    },

    /// Drive simulated devices
    Simulate {
        /// Program time runs this many times faster than the wall clock
        #[arg(long, default_value_t = 60.0)]
        speedup: f64,

        /// Order table to apply at startup
        #[arg(long)]
        order_table: Option<PathBuf>,

        /// Write all output under this directory instead of the configured one
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the task ledger as a status report
    Status,

    /// Run an autofocus scan against simulated optics
    Focus {
        /// Best focus of the simulated optics, relative to the start
        #[arg(long, default_value_t = 0.0)]
        best_focus: f64,

        /// Allow the peak this far beyond the scanned range
        #[arg(long, default_value_t = 0.0)]
        margin: f64,
    },

    /// Print the default configuration as TOML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::DefaultConfig = cli.command {
        println!("{}", toml::to_string_pretty(&RigConfig::default())?);
        return Ok(());
    }

    let config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run { order_table } => run_hardware(config, order_table).await,
        Commands::Simulate {
            speedup,
            order_table,
            data_dir,
        } => {
            let mut config = config;
            if let Some(dir) = data_dir {
                config.storage = config.storage.rooted_at(dir);
            }
            run_simulated(config, speedup, order_table).await
        }
        Commands::Status => print_status(&config),
        Commands::Focus { best_focus, margin } => run_focus(&config, best_focus, margin).await,
        Commands::DefaultConfig => Ok(()),
    }
}

fn print_status(config: &RigConfig) -> Result<()> {
    let path = config.storage.resolve(&config.storage.ledger_file);
    let ledger =
        TaskLedger::load(&path).with_context(|| format!("reading ledger {}", path.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status_report(ledger.records()))?
    );
    Ok(())
}

async fn run_focus(config: &RigConfig, best_focus: f64, margin: f64) -> Result<()> {
    let optics = SimulatedOptics::new(best_focus, 3.0 * config.focus.step);
    let scan = FocusScan {
        margin,
        ..FocusScan::from(&config.focus)
    };
    let result = focus_search(&optics, &optics, scan).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

struct DeviceLinks {
    temperature: Box<dyn Link>,
    flow: Box<dyn Link>,
    interlock: Box<dyn Link>,
    timing: AibusTiming,
    settle: Duration,
}

fn spawn_devices(config: &RigConfig, links: DeviceLinks) -> Result<RigDevices> {
    let period = Duration::from_millis(config.experiment.worker_period_ms);
    let temperature = spawn_worker(
        DeviceLoop::new(
            "temperature",
            links.temperature,
            TemperaturePoller::new(links.timing),
        ),
        period,
    )?;
    let flow = spawn_worker(
        DeviceLoop::new(
            "flow",
            links.flow,
            FlowPoller::new(config.flow.channels.clone(), links.settle),
        ),
        period,
    )?;
    let interlock = spawn_worker(
        DeviceLoop::new(
            "interlock",
            links.interlock,
            InterlockPoller::new(&config.interlock, links.settle),
        ),
        period,
    )?;
    Ok(RigDevices {
        temperature: Arc::new(temperature),
        flow: Arc::new(flow),
        interlock: Arc::new(interlock),
        camera: Arc::new(MockCamera::new()),
    })
}

#[cfg(feature = "instrument_serial")]
async fn run_hardware(config: RigConfig, order_table: Option<PathBuf>) -> Result<()> {
    use cvd_rig::hardware::link::{Framing, SerialLink};

    let links = DeviceLinks {
        temperature: Box::new(SerialLink::open(
            &config.serial.temperature,
            Framing::EightNoneOne,
        )?),
        flow: Box::new(SerialLink::open(&config.serial.flow, Framing::EightNoneTwo)?),
        interlock: Box::new(SerialLink::open(
            &config.serial.interlock,
            Framing::EightNoneTwo,
        )?),
        timing: AibusTiming::default(),
        settle: Duration::from_millis(50),
    };
    let devices = spawn_devices(&config, links)?;
    serve(&config, devices, order_table, None).await
}

#[cfg(not(feature = "instrument_serial"))]
async fn run_hardware(_config: RigConfig, _order_table: Option<PathBuf>) -> Result<()> {
    Err(cvd_rig::RigError::SerialFeatureDisabled.into())
}

async fn run_simulated(
    config: RigConfig,
    speedup: f64,
    order_table: Option<PathBuf>,
) -> Result<()> {
    info!(speedup, "Starting with simulated devices");
    let interlock = SimLink::new(InterlockModel::new(
        config.interlock.address,
        usize::from(config.interlock.input_count),
    ));
    let links = DeviceLinks {
        temperature: SimLink::new(TemperatureModel::with_speedup(speedup)).boxed(),
        flow: SimLink::new(FlowBankModel::with_channels(
            config.flow.channels.iter().copied(),
            SIM_FULL_SCALE,
        ))
        .boxed(),
        interlock: interlock.boxed(),
        timing: AibusTiming::immediate(),
        settle: Duration::ZERO,
    };
    let devices = spawn_devices(&config, links)?;
    serve(&config, devices, order_table, Some(interlock)).await
}

async fn serve(
    config: &RigConfig,
    devices: RigDevices,
    order_table: Option<PathBuf>,
    plc: Option<SimulatedInterlock>,
) -> Result<()> {
    let mut orchestrator =
        Orchestrator::new(devices.clone(), OrchestratorSettings::from_config(config)?);
    if let Some(path) = order_table {
        orchestrator
            .apply_config(&path)
            .await
            .with_context(|| format!("applying {}", path.display()))?;
    }

    let (service, client) = RigService::new(
        orchestrator,
        Duration::from_millis(config.experiment.tick_ms),
    );
    let (quit_tx, quit_rx) = oneshot::channel();
    let console = tokio::spawn(console(client, config.clone(), plc, quit_tx));

    let shutdown = async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
            }
            _ = quit_rx => {}
        }
    };
    let orchestrator = service.run(shutdown).await;
    console.abort();

    info!(state = %orchestrator.state(), "Stopping device workers");
    devices.temperature.stop();
    devices.flow.stop();
    devices.interlock.stop();
    Ok(())
}

/// Read a CSV order table into JSON records.
fn read_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        records.push(
            headers
                .iter()
                .zip(row.iter())
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        );
    }
    Ok(records)
}

async fn console(
    client: RemoteClient,
    config: RigConfig,
    plc: Option<SimulatedInterlock>,
    quit: oneshot::Sender<()>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        let outcome: Result<()> = match (words.next(), words.next()) {
            (Some("start"), _) => client.start_experiment().await.map_err(Into::into),
            (Some("stop"), _) => client.stop_experiment().await.map_err(Into::into),
            (Some("status"), _) => match client.get_status().await {
                Ok(report) => serde_json::to_string_pretty(&report)
                    .map(|text| println!("{text}"))
                    .map_err(Into::into),
                Err(e) => Err(e.into()),
            },
            (Some("load"), Some(path)) => load_table(&client, Path::new(path)).await,
            (Some(word @ ("restart" | "clear")), _) => {
                set_plc_inputs(plc.as_ref(), &config, word == "restart")
            }
            (Some("quit"), _) => {
                let _ = quit.send(());
                return;
            }
            (Some(other), _) => Err(anyhow::anyhow!(
                "unknown command '{other}' (start, stop, status, load <csv>, restart, clear, quit)"
            )),
            (None, _) => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "Console command failed");
        }
    }
    // stdin closed (detached process): keep serving until ctrl-c.
    info!("Console input closed");
    std::future::pending::<()>().await
}

async fn load_table(client: &RemoteClient, path: &Path) -> Result<()> {
    let experiment_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("order table needs a file name")?;
    let records = read_records(path)?;
    client.set_parameters(experiment_id, records).await?;
    Ok(())
}

fn set_plc_inputs(
    plc: Option<&SimulatedInterlock>,
    config: &RigConfig,
    restart: bool,
) -> Result<()> {
    let plc = plc.context("PLC inputs can only be set on simulated devices")?;
    let pattern = if restart {
        &config.interlock.restart_pattern
    } else {
        &config.interlock.clear_pattern
    };
    let inputs = parse_pattern(pattern)?;
    plc.with_device(|model| model.inputs = inputs);
    info!(pattern = %pattern, "Simulated PLC inputs set");
    Ok(())
}
