//! Layered configuration loading.

use std::io::Write;
use std::path::Path;

use cvd_rig::config::RigConfig;
use cvd_rig::hardware::interlock::parse_pattern;
use cvd_rig::RigError;

fn write_toml(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("rig.toml");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(contents.as_bytes())
        .unwrap();
    path
}

#[test]
fn test_shipped_config_loads_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/rig.toml");
    let config = RigConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.flow.channels.len(), 16);
    assert_eq!(config.flow.direct_gases.get("CH4"), Some(&1));
    assert_eq!(config.interlock.fire_code, 121);
    assert_eq!(
        parse_pattern(&config.interlock.restart_pattern).unwrap().len(),
        usize::from(config.interlock.input_count)
    );
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_toml(
        dir.path(),
        r#"
[serial.flow]
port = "/dev/ttyS9"

[storage]
data_dir = "/srv/cvd"
"#,
    );
    let config = RigConfig::load_from(&path).unwrap();
    let defaults = RigConfig::default();

    assert_eq!(config.serial.flow.port, "/dev/ttyS9");
    assert_eq!(config.serial.flow.baud_rate, defaults.serial.flow.baud_rate);
    assert_eq!(config.serial.temperature.port, defaults.serial.temperature.port);
    assert_eq!(
        config.storage.resolve(&config.storage.ledger_file),
        Path::new("/srv/cvd").join("task_ledger.csv")
    );
    config.validate().unwrap();
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = RigConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.application.name, RigConfig::default().application.name);
}

#[test]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_toml(dir.path(), "[focus]\nsearch_num = 3\nstep = 2.0\n");

    std::env::set_var("CVD_RIG_FOCUS__SEARCH_NUM", "9");
    let loaded = RigConfig::load_from(&path);
    std::env::remove_var("CVD_RIG_FOCUS__SEARCH_NUM");

    let config = loaded.unwrap();
    assert_eq!(config.focus.search_num, 9);
    assert_eq!(config.focus.step, 2.0);
}

#[test]
fn test_malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_toml(dir.path(), "[experiment]\npurge_seconds = \"soon\"\n");
    assert!(matches!(
        RigConfig::load_from(&path),
        Err(RigError::Config(_))
    ));
}

#[test]
fn test_empty_threshold_window_rejected() {
    let mut config = RigConfig::default();
    config.experiment.threshold_low = 50.0;
    config.experiment.threshold_high = 50.0;
    let err = config.validate().unwrap_err();
    assert!(matches!(err, RigError::Configuration(_)));
    assert!(err.to_string().contains("Threshold window"));
}

#[test]
fn test_unpolled_direct_gas_rejected() {
    let mut config = RigConfig::default();
    config.flow.channels = vec![0, 2];
    config.flow.direct_gases.insert("CH4".into(), 7);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("channel 7"));
}
