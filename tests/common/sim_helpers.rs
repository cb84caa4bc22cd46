//! Simulated hardware helpers

use bioview_rs::backend::FrontendHandle;
use bioview_rs::hardware::sim::{SimDeviceSpec, SimDriver, SimTone};
use bioview_rs::hardware::TimeSpec;
use bioview_rs::{BackendMessage, ConnectionState, ExperimentConfig, RawSampleBuffer};
use num_complex::Complex32;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

/// Sim driver with one radio per configured device, emitting every IF tone
pub fn sim_driver_for(config: &ExperimentConfig) -> SimDriver {
    let mut driver = SimDriver::new();
    for (i, device) in config.devices.iter().enumerate() {
        let tones = device.if_freq.iter().map(|&f| SimTone::new(f, 0.5)).collect();
        driver = driver.with_device(
            SimDeviceSpec::new(device.name.clone(), format!("SIM{}", i))
                .with_tones(tones)
                .with_samps_per_packet(500)
                .with_realtime(true),
        );
    }
    driver
}

/// Unit-amplitude tone starting at sample `start`
pub fn tone(start: usize, len: usize, freq: f64, sample_rate: f64) -> Vec<Complex32> {
    (start..start + len)
        .map(|n| {
            let phase = 2.0 * PI * freq * n as f64 / sample_rate;
            Complex32::new(phase.cos() as f32, phase.sin() as f32)
        })
        .collect()
}

/// Buffer for `device` whose every row carries the sum of `freqs`
pub fn tone_buffer(
    device: usize,
    rows: usize,
    start: usize,
    len: usize,
    freqs: &[f64],
    sample_rate: f64,
) -> RawSampleBuffer {
    let mut row = vec![Complex32::new(0.0, 0.0); len];
    for &freq in freqs {
        for (acc, s) in row.iter_mut().zip(tone(start, len, freq, sample_rate)) {
            *acc += s;
        }
    }
    RawSampleBuffer::new(device, TimeSpec::default(), vec![row; rows])
}

/// Wait for a status message of `device_id`; returns the last state seen
pub fn wait_for_status(
    frontend: &FrontendHandle,
    device_id: &str,
    wanted: ConnectionState,
    timeout: Duration,
) -> (ConnectionState, Vec<BackendMessage>) {
    let deadline = Instant::now() + timeout;
    let mut state = ConnectionState::Disconnected;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Some(msg) = frontend.recv_timeout(Duration::from_millis(20)) {
            if let BackendMessage::Status { device_id: id, state: s } = &msg {
                if id == device_id {
                    state = *s;
                }
            }
            seen.push(msg);
            if state == wanted {
                break;
            }
        }
    }
    (state, seen)
}

/// Wait for a message matching `pred`
pub fn wait_for<F>(frontend: &FrontendHandle, timeout: Duration, mut pred: F) -> Option<BackendMessage>
where
    F: FnMut(&BackendMessage) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(msg) = frontend.recv_timeout(Duration::from_millis(20)) {
            if pred(&msg) {
                return Some(msg);
            }
        }
    }
    None
}
