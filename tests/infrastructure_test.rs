//! Test to verify test infrastructure works correctly

mod common;

use common::builders::ExperimentBuilder;
use common::sim_helpers::{sim_driver_for, tone_buffer};

#[test]
fn test_infrastructure_setup() {
    let config = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .device("usrp1", [150e3, 175e3])
        .build();

    assert_eq!(config.devices.len(), 2);
    assert!(config.validate().is_ok());

    let driver = sim_driver_for(&config);
    assert!(driver.radio_by_name("usrp1").is_some());

    let buffer = tone_buffer(1, 2, 0, 64, &[100e3], config.sample_rate);
    assert_eq!(buffer.device, 1);
    assert_eq!(buffer.samples_per_channel(), Some(64));
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
