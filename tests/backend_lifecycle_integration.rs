//! Integration tests for backend lifecycle
//!
//! These tests validate the complete backend workflow against simulated radios:
//! - Connection and disconnection
//! - Streaming start/stop with saving and display
//! - Live parameter updates
//! - Backend message handling
//! - A biosignal amplifier streaming beside the radios

mod common;

use bioview_rs::backend::{AcquisitionBackend, BackendMessage};
use bioview_rs::hardware::biosignal::{SimBiosignalDriver, SimBiosignalSpec};
use bioview_rs::hardware::sim::SimDriver;
use bioview_rs::types::LogLevel;
use bioview_rs::ConnectionState;
use common::builders::ExperimentBuilder;
use common::sim_helpers::{sim_driver_for, wait_for, wait_for_status};
use common::test_timeout;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_backend_creation_and_shutdown() {
    let config = ExperimentBuilder::new().device("usrp0", [100e3, 125e3]).build();
    let (backend, frontend) = AcquisitionBackend::new(config, Arc::new(SimDriver::new()));

    let handle = thread::spawn(move || backend.run());
    thread::sleep(Duration::from_millis(50));

    frontend.shutdown();

    let result = handle.join();
    assert!(result.is_ok(), "Backend thread should exit cleanly");
    assert!(frontend
        .drain()
        .iter()
        .any(|m| matches!(m, BackendMessage::Shutdown)));
}

#[test]
fn test_stream_save_and_stop() {
    let config = ExperimentBuilder::new().device("usrp0", [100e3, 125e3]).build();
    let driver = Arc::new(sim_driver_for(&config));
    let (backend, frontend) = AcquisitionBackend::new(config, driver);
    let handle = thread::spawn(move || backend.run());

    let dir = tempdir().unwrap();
    let path = dir.path().join("session.csv");
    frontend.set_save(Some(path.clone()));
    frontend.connect();
    let (state, _) = wait_for_status(&frontend, "multi_usrp", ConnectionState::Connected, test_timeout());
    assert_eq!(state, ConnectionState::Connected);

    frontend.start();
    let display = wait_for(&frontend, test_timeout(), |m| {
        matches!(m, BackendMessage::Display { .. })
    });
    match display {
        Some(BackendMessage::Display { source, data }) => {
            assert!(source.label.starts_with("Tx"));
            assert_eq!(data.len(), 1);
        }
        other => panic!("expected display data, got {:?}", other),
    }
    thread::sleep(Duration::from_millis(200));

    // Stop twice: the second is a no-op
    frontend.stop();
    frontend.stop();
    let stats = wait_for(&frontend, test_timeout(), |m| matches!(m, BackendMessage::Stats(_)));
    let Some(BackendMessage::Stats(summary)) = stats else {
        panic!("expected run statistics");
    };
    assert!(summary.engine.blocks_emitted > 0);
    assert_eq!(summary.acquisition.len(), 1);
    assert_eq!(summary.transmission.len(), 1);
    assert_eq!(summary.save.as_ref().map(|s| s.failed), Some(0));

    thread::sleep(Duration::from_millis(100));
    let later = frontend.drain();
    assert!(!later.iter().any(|m| matches!(m, BackendMessage::Stats(_))));

    frontend.shutdown();
    handle.join().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let rows = text.lines().skip(2).count() as u64;
    let windows = summary.save.map(|s| s.written).unwrap_or(0) * 10;
    assert!(rows > 0);
    assert_eq!(rows, windows);
}

#[test]
fn test_missing_device_disconnects_group() {
    let config = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .device("usrp1", [150e3, 175e3])
        .build();
    // Only usrp0 is attached
    let attached = ExperimentBuilder::new().device("usrp0", [100e3, 125e3]).build();
    let driver = Arc::new(sim_driver_for(&attached));
    let (backend, frontend) = AcquisitionBackend::new(config, driver);
    let handle = thread::spawn(move || backend.run());

    frontend.connect();
    let (state, seen) = wait_for_status(&frontend, "multi_usrp", ConnectionState::Disconnected, test_timeout());
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(seen.iter().any(|m| matches!(
        m,
        BackendMessage::Status { device_id, state: ConnectionState::Connecting } if device_id == "multi_usrp"
    )));
    let failure = wait_for(&frontend, test_timeout(), |m| {
        matches!(m, BackendMessage::Log { level: LogLevel::Error, message } if message.contains("usrp1"))
    });
    let reported_in_seen = seen.iter().any(|m| {
        matches!(m, BackendMessage::Log { level: LogLevel::Error, message } if message.contains("usrp1"))
    });
    assert!(failure.is_some() || reported_in_seen);

    frontend.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_gain_update_while_streaming() {
    let config = ExperimentBuilder::new().device("usrp0", [100e3, 125e3]).build();
    let driver = Arc::new(sim_driver_for(&config));
    let (backend, frontend) = AcquisitionBackend::new(config, driver.clone());
    let handle = thread::spawn(move || backend.run());

    frontend.connect();
    wait_for_status(&frontend, "multi_usrp", ConnectionState::Connected, test_timeout());
    frontend.start();

    frontend.configure("usrp0.tx_gain", &json!([7.5, 3.0])).unwrap();
    assert!(frontend.configure("usrp0.bogus", &json!(1)).is_err());

    let radio = driver.radio_by_name("usrp0").unwrap();
    let deadline = std::time::Instant::now() + test_timeout();
    while radio.tx_gains() != vec![7.5, 3.0] && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(radio.tx_gains(), vec![7.5, 3.0]);

    frontend.disconnect();
    let (state, _) = wait_for_status(&frontend, "multi_usrp", ConnectionState::Disconnected, test_timeout());
    assert_eq!(state, ConnectionState::Disconnected);

    frontend.shutdown();
    handle.join().unwrap();
}

#[test]
fn test_biosignal_device_streams_with_radios() {
    let config = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .biosignal("biopac", vec![true, false, true])
        .build();
    let driver = Arc::new(sim_driver_for(&config));
    let amplifier = Arc::new(SimBiosignalDriver::new(SimBiosignalSpec::default().with_realtime(true)));
    let (backend, frontend) = AcquisitionBackend::new(config, driver);
    let backend = backend.with_biosignal_driver(amplifier.clone());
    let handle = thread::spawn(move || backend.run());

    let dir = tempdir().unwrap();
    frontend.set_save(Some(dir.path().join("session.csv")));
    frontend.connect();

    // Both children report on their own; either may finish first
    let (bio_state, seen) = wait_for_status(&frontend, "biopac", ConnectionState::Connected, test_timeout());
    assert_eq!(bio_state, ConnectionState::Connected);
    let radios_up = seen.iter().any(|m| matches!(
        m,
        BackendMessage::Status { device_id, state: ConnectionState::Connected } if device_id == "multi_usrp"
    ));
    if !radios_up {
        let (state, _) = wait_for_status(&frontend, "multi_usrp", ConnectionState::Connected, test_timeout());
        assert_eq!(state, ConnectionState::Connected);
    }

    frontend.start();
    let display = wait_for(&frontend, test_timeout(), |m| {
        matches!(m, BackendMessage::Display { source, .. } if source.label == "Ch3")
    });
    assert!(display.is_some(), "expected biosignal display data");
    thread::sleep(Duration::from_millis(100));

    frontend.stop();
    let stats = wait_for(&frontend, test_timeout(), |m| matches!(m, BackendMessage::Stats(_)));
    let Some(BackendMessage::Stats(summary)) = stats else {
        panic!("expected run statistics");
    };
    let bio = summary.biosignal.expect("biosignal statistics");
    assert!(bio.samples > 0);
    assert_eq!(bio.read_errors, 0);

    let saved = std::fs::read_to_string(dir.path().join("session_biopac.csv")).unwrap();
    assert_eq!(saved.lines().nth(1), Some("timestamp_ms,Ch1,Ch3"));

    frontend.disconnect();
    let (state, _) = wait_for_status(&frontend, "biopac", ConnectionState::Disconnected, test_timeout());
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(amplifier.log().disconnects, 1);

    frontend.shutdown();
    handle.join().unwrap();
}
