//! Validation of the shipped configuration file and of bad settings.

use datalog::adc::hrdl::constants::{Channel, ConversionTime, VoltageRange};
use datalog::adc::AdcKind;
use datalog::config::{ChannelConfig, OutputUnit, Settings};
use datalog::error::DaqError;
use datalog::network::DataFormat;
use serial_test::serial;

fn channel(n: u8) -> ChannelConfig {
    ChannelConfig::new(Channel::new(n).unwrap())
}

#[test]
#[serial]
fn test_shipped_config_loads() {
    let settings = Settings::load_from("config/datalog.toml").unwrap();

    assert_eq!(settings.application.name, "datalog");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.default_format, DataFormat::Json);
    assert_eq!(settings.adc.kind, AdcKind::PicoLog24Sim);
    assert_eq!(settings.device.conversion_time, ConversionTime::Time660ms);
    assert_eq!(settings.device.output_unit, OutputUnit::Counts);
    assert_eq!(settings.device.channel_numbers(), vec![1]);
    assert_eq!(settings.device.channels[0].range, VoltageRange::Range2500mV);
    assert!(settings.log_file.is_none());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    std::env::set_var("DATALOG_SERVER__PORT", "9555");
    std::env::set_var("DATALOG_FETCH__POLL_TIME_MS", "250");
    let result = Settings::load_from("config/datalog.toml");
    std::env::remove_var("DATALOG_SERVER__PORT");
    std::env::remove_var("DATALOG_FETCH__POLL_TIME_MS");

    let settings = result.unwrap();
    assert_eq!(settings.server.port, 9555);
    assert_eq!(settings.fetch.poll_time_ms, 250);
}

#[test]
#[serial]
fn test_invalid_environment_value_is_reported() {
    std::env::set_var("DATALOG_DEVICE__SAMPLE_TIME_MS", "20000");
    let result = Settings::load_from("config/datalog.toml");
    std::env::remove_var("DATALOG_DEVICE__SAMPLE_TIME_MS");

    match result {
        Err(DaqError::Configuration(msg)) => assert!(msg.contains("sample_time_ms")),
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

#[test]
fn test_conversion_budget_rejected() {
    let mut settings = Settings::default();
    settings.device.sample_time_ms = 1000;
    settings.device.conversion_time = ConversionTime::Time660ms;
    settings.device.channels = vec![channel(1), channel(3)];

    let err = settings.validate().unwrap_err();
    assert!(err.contains("1320 ms"));

    settings.device.conversion_time = ConversionTime::Time340ms;
    assert!(settings.validate().is_ok());
}

#[test]
fn test_duplicate_channels_rejected() {
    let mut settings = Settings::default();
    settings.device.conversion_time = ConversionTime::Time60ms;
    settings.device.channels = vec![channel(4), channel(4)];

    assert!(settings.validate().unwrap_err().contains("Duplicate channel: 4"));
}

#[test]
fn test_request_limits_rejected() {
    let mut settings = Settings::default();
    settings.server.max_readings_per_request = 5000;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.server.max_readings_per_request = 10;
    settings.server.default_readings_per_request = 50;
    assert!(settings
        .validate()
        .unwrap_err()
        .contains("default_readings_per_request"));
}

#[test]
fn test_zero_sizes_rejected() {
    let mut settings = Settings::default();
    settings.datastore.max_size = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.fetch.poll_time_ms = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.server.max_connections = 0;
    assert!(settings.validate().is_err());
}
