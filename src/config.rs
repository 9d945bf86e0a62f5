//! Rig configuration using Figment
//!
//! Configuration is layered:
//! 1. built-in defaults ([`RigConfig::default`])
//! 2. `config/rig.toml` (or any file passed to [`RigConfig::load_from`])
//! 3. environment variables prefixed with `CVD_RIG_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use cvd_rig::config::RigConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // CVD_RIG_EXPERIMENT__PURGE_SECONDS=60 overrides the file value
//! let config = RigConfig::load()?;
//! config.validate()?;
//! println!("purge: {}s", config.experiment.purge_seconds);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, RigError};

/// Default location of the rig configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial links, one per device worker
    #[serde(default)]
    pub serial: SerialConfig,
    /// Experiment sequencing
    #[serde(default)]
    pub experiment: ExperimentConfig,
    /// Mass-flow controller bank
    #[serde(default)]
    pub flow: FlowConfig,
    /// PLC interlock
    #[serde(default)]
    pub interlock: InterlockConfig,
    /// Files written by the orchestrator
    #[serde(default)]
    pub storage: StorageConfig,
    /// Autofocus scan
    #[serde(default)]
    pub focus: FocusConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Port settings for the three serial links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Dual-zone temperature controller (sum-checksum protocol, 8-N-1)
    #[serde(default = "default_temperature_port")]
    pub temperature: PortConfig,
    /// Mass-flow controller bank (CRC16 protocol, 8-N-2)
    #[serde(default = "default_flow_port")]
    pub flow: PortConfig,
    /// PLC interlock (CRC16 protocol, 8-N-2)
    #[serde(default = "default_interlock_port")]
    pub interlock: PortConfig,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature_port(),
            flow: default_flow_port(),
            interlock: default_interlock_port(),
        }
    }
}

/// One serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-frame read timeout in milliseconds
    #[serde(default = "default_frame_timeout")]
    pub timeout_ms: u64,
}

impl PortConfig {
    fn named(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_frame_timeout(),
        }
    }
}

/// Experiment sequencing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Purge countdown before the programs start, in ticks (seconds)
    #[serde(default = "default_purge_seconds")]
    pub purge_seconds: u32,
    /// Orchestrator tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Device worker poll period in milliseconds
    #[serde(default = "default_worker_period_ms")]
    pub worker_period_ms: u64,
    /// Completion window lower bound on zone B process value
    #[serde(default = "default_threshold_low")]
    pub threshold_low: f64,
    /// Completion window upper bound on zone B process value
    #[serde(default = "default_threshold_high")]
    pub threshold_high: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            purge_seconds: default_purge_seconds(),
            tick_ms: default_tick_ms(),
            worker_period_ms: default_worker_period_ms(),
            threshold_low: default_threshold_low(),
            threshold_high: default_threshold_high(),
        }
    }
}

/// Mass-flow controller bank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Device addresses polled on the flow link (channel number == address)
    #[serde(default = "default_flow_channels")]
    pub channels: Vec<u8>,
    /// Ar/H2 mixture mapping
    #[serde(default)]
    pub mixing: MixingConfig,
    /// Gases that map straight onto one channel, e.g. `{ N2 = 5 }`
    #[serde(default)]
    pub direct_gases: BTreeMap<String, u8>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            channels: default_flow_channels(),
            mixing: MixingConfig::default(),
            direct_gases: BTreeMap::new(),
        }
    }
}

/// Linear mixing of a primary carrier gas and a secondary gas delivered as a
/// premixed cylinder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixingConfig {
    /// Primary gas column prefix in the order table
    #[serde(default = "default_primary_gas")]
    pub primary_gas: String,
    /// Secondary gas column prefix in the order table
    #[serde(default = "default_secondary_gas")]
    pub secondary_gas: String,
    /// Channel carrying the pure primary gas
    #[serde(default = "default_primary_channel")]
    pub primary_channel: u8,
    /// Channel carrying the premixed secondary gas
    #[serde(default)]
    pub secondary_channel: u8,
    /// Fraction of secondary gas in the premix cylinder
    #[serde(default = "default_mixture_fraction")]
    pub mixture_fraction: f64,
    /// Primary gas delivered per unit of secondary gas through the premix
    #[serde(default = "default_cross_factor")]
    pub cross_factor: f64,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            primary_gas: default_primary_gas(),
            secondary_gas: default_secondary_gas(),
            primary_channel: default_primary_channel(),
            secondary_channel: 0,
            mixture_fraction: default_mixture_fraction(),
            cross_factor: default_cross_factor(),
        }
    }
}

/// PLC interlock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterlockConfig {
    /// Device address of the PLC
    #[serde(default = "default_interlock_address")]
    pub address: u8,
    /// Holding register receiving the intent code
    #[serde(default)]
    pub intent_register: u16,
    /// First discrete input of the restart vector
    #[serde(default)]
    pub input_start: u16,
    /// Width of the restart vector
    #[serde(default = "default_input_count")]
    pub input_count: u16,
    /// Code written while the completion condition holds
    #[serde(default = "default_fire_code")]
    pub fire_code: u16,
    /// Code written while a restart is latched
    #[serde(default = "default_rerun_code")]
    pub rerun_code: u16,
    /// Code written otherwise
    #[serde(default = "default_idle_code")]
    pub idle_code: u16,
    /// Input vector that latches the restart flag, e.g. "1000111100"
    #[serde(default = "default_restart_pattern")]
    pub restart_pattern: String,
    /// Input vector that clears the restart flag
    #[serde(default = "default_clear_pattern")]
    pub clear_pattern: String,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            address: default_interlock_address(),
            intent_register: 0,
            input_start: 0,
            input_count: default_input_count(),
            fire_code: default_fire_code(),
            rerun_code: default_rerun_code(),
            idle_code: default_idle_code(),
            restart_pattern: default_restart_pattern(),
            clear_pattern: default_clear_pattern(),
        }
    }
}

/// Files written by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; relative paths below are resolved against it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Order tables written by `set-parameters`
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Result tables
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Recorded videos
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,
    /// Captured stills
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Task ledger file
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
    /// Tracking profile (current table and order index)
    #[serde(default = "default_profile_file")]
    pub profile_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            results_dir: default_results_dir(),
            video_dir: default_video_dir(),
            image_dir: default_image_dir(),
            ledger_file: default_ledger_file(),
            profile_file: default_profile_file(),
        }
    }
}

impl StorageConfig {
    /// Resolve a storage path against `data_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Same configuration rooted at another data directory.
    pub fn rooted_at(&self, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..self.clone()
        }
    }
}

/// Autofocus scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    /// Positions sampled on each side of the start position
    #[serde(default = "default_search_num")]
    pub search_num: u32,
    /// Distance between samples, in focus drive units
    #[serde(default = "default_focus_step")]
    pub step: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            search_num: default_search_num(),
            step: default_focus_step(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "cvd-rig".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_temperature_port() -> PortConfig {
    PortConfig::named("/dev/ttyUSB0")
}

fn default_flow_port() -> PortConfig {
    PortConfig::named("/dev/ttyUSB1")
}

fn default_interlock_port() -> PortConfig {
    PortConfig::named("/dev/ttyUSB2")
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_frame_timeout() -> u64 {
    150
}

fn default_purge_seconds() -> u32 {
    180
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_worker_period_ms() -> u64 {
    1000
}

fn default_threshold_low() -> f64 {
    20.0
}

fn default_threshold_high() -> f64 {
    100.0
}

fn default_flow_channels() -> Vec<u8> {
    (0..16).collect()
}

fn default_primary_gas() -> String {
    "Ar".to_string()
}

fn default_secondary_gas() -> String {
    "H2".to_string()
}

fn default_primary_channel() -> u8 {
    2
}

fn default_mixture_fraction() -> f64 {
    0.131
}

fn default_cross_factor() -> f64 {
    1179.0 / 131.0
}

fn default_interlock_address() -> u8 {
    3
}

fn default_input_count() -> u16 {
    10
}

fn default_fire_code() -> u16 {
    121
}

fn default_rerun_code() -> u16 {
    63
}

fn default_idle_code() -> u16 {
    120
}

fn default_restart_pattern() -> String {
    "1000111100".to_string()
}

fn default_clear_pattern() -> String {
    "0000111100".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("video")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("image")
}

fn default_ledger_file() -> PathBuf {
    PathBuf::from("task_ledger.csv")
}

fn default_profile_file() -> PathBuf {
    PathBuf::from("profile.json")
}

fn default_search_num() -> u32 {
    5
}

fn default_focus_step() -> f64 {
    4.0
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `CVD_RIG_`.
    /// Example: `CVD_RIG_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CVD_RIG_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for (name, port) in [
            ("temperature", &self.serial.temperature),
            ("flow", &self.serial.flow),
            ("interlock", &self.serial.interlock),
        ] {
            if port.baud_rate == 0 {
                return Err(RigError::Configuration(format!(
                    "serial.{name}.baud_rate must be positive"
                )));
            }
            if port.timeout_ms == 0 {
                return Err(RigError::Configuration(format!(
                    "serial.{name}.timeout_ms must be positive"
                )));
            }
        }

        let experiment = &self.experiment;
        if experiment.tick_ms == 0 || experiment.worker_period_ms == 0 {
            return Err(RigError::Configuration(
                "experiment.tick_ms and experiment.worker_period_ms must be positive".into(),
            ));
        }
        if experiment.threshold_low >= experiment.threshold_high {
            return Err(RigError::Configuration(format!(
                "Threshold window [{}, {}] is empty",
                experiment.threshold_low, experiment.threshold_high
            )));
        }

        let mixing = &self.flow.mixing;
        if mixing.mixture_fraction <= 0.0 || mixing.mixture_fraction > 1.0 {
            return Err(RigError::Configuration(format!(
                "flow.mixing.mixture_fraction {} must be in (0, 1]",
                mixing.mixture_fraction
            )));
        }
        let mut channels = vec![mixing.primary_channel, mixing.secondary_channel];
        channels.extend(self.flow.direct_gases.values().copied());
        if let Some(missing) = channels.iter().find(|c| !self.flow.channels.contains(c)) {
            return Err(RigError::Configuration(format!(
                "Flow channel {missing} is mapped to a gas but not polled"
            )));
        }

        let width = usize::from(self.interlock.input_count);
        for (name, pattern) in [
            ("restart_pattern", &self.interlock.restart_pattern),
            ("clear_pattern", &self.interlock.clear_pattern),
        ] {
            let bits = crate::hardware::interlock::parse_pattern(pattern)?;
            if bits.len() != width {
                return Err(RigError::Configuration(format!(
                    "interlock.{name} has {} bits, expected {width}",
                    bits.len()
                )));
            }
        }

        if self.focus.step <= 0.0 {
            return Err(RigError::Configuration(
                "focus.step must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RigConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_pattern_of_wrong_width() {
        let mut config = RigConfig::default();
        config.interlock.restart_pattern = "1010".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("restart_pattern"));
    }

    #[test]
    fn rejects_unpolled_mixing_channel() {
        let mut config = RigConfig::default();
        config.flow.channels = vec![0, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_paths_resolve_against_data_dir() {
        let storage = StorageConfig::default().rooted_at("/srv/rig");
        assert_eq!(
            storage.resolve(&storage.ledger_file),
            PathBuf::from("/srv/rig/task_ledger.csv")
        );
        assert_eq!(
            storage.resolve(Path::new("/abs/file.csv")),
            PathBuf::from("/abs/file.csv")
        );
    }
}
