use tmst4d::{init_logging, DriverConfig};

#[test]
fn logger_installs_once() {
    let config = DriverConfig::from_toml("log_level = \"trace\"").unwrap();
    init_logging(&config).unwrap();
    log::info!("logger up");
    assert!(init_logging(&config).is_err());
}
