//! Biosignal amplifier interface
//!
//! Biosignal amplifiers (BIOPAC MP-series and similar) deliver a low-rate
//! multi-channel analog stream next to the radios. The vendor library is
//! polled for the most recent sample, one frame at a time: a timestamp in
//! milliseconds followed by one value per enabled channel.
//!
//! [`BiosignalDriver`] connects and configures a device; the returned
//! [`BiosignalDevice`] is owned by one worker. [`SimBiosignalDriver`] is a
//! deterministic stand-in used by tests and the command line runner.

use crate::config::BiosignalConfig;
use crate::error::{BioviewError, Result};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opens biosignal devices
pub trait BiosignalDriver: Send + Sync {
    /// Connect, select the enabled channels and set the sample interval
    fn connect(&self, config: &BiosignalConfig) -> Result<Box<dyn BiosignalDevice>>;
}

/// A connected biosignal amplifier
pub trait BiosignalDevice: Send {
    /// Enabled channels; a frame holds one more value for the timestamp
    fn num_channels(&self) -> usize;

    fn start_acquisition(&mut self) -> Result<()>;

    /// Copy the newest sample into `frame`
    ///
    /// Returns `false` when no sample arrived since the previous call.
    fn most_recent_sample(&mut self, frame: &mut [f64]) -> Result<bool>;

    fn stop_acquisition(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

// ==================== Simulated Amplifier ====================

/// Behaviour of the simulated amplifier
#[derive(Debug, Clone)]
pub struct SimBiosignalSpec {
    pub device_type: String,
    /// Whether the amplifier answers at all
    pub attached: bool,
    /// Frequency of the synthetic waveform on every channel (Hz)
    pub signal_hz: f64,
    /// Deliver samples at the configured rate instead of on every poll
    pub realtime: bool,
    /// Fail the read after this many samples
    pub fail_after: Option<u64>,
}

impl Default for SimBiosignalSpec {
    fn default() -> Self {
        Self {
            device_type: "MP36".to_string(),
            attached: true,
            signal_hz: 1.2,
            realtime: false,
            fail_after: None,
        }
    }
}

impl SimBiosignalSpec {
    pub fn detached() -> Self {
        Self {
            attached: false,
            ..Default::default()
        }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_fail_after(mut self, samples: u64) -> Self {
        self.fail_after = Some(samples);
        self
    }
}

/// Calls observed by the simulated amplifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimBiosignalLog {
    pub connects: u32,
    pub starts: u32,
    pub stops: u32,
    pub disconnects: u32,
    pub acquiring: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Driver producing [`SimBiosignal`] devices
#[derive(Debug, Default)]
pub struct SimBiosignalDriver {
    spec: SimBiosignalSpec,
    log: Arc<Mutex<SimBiosignalLog>>,
}

impl SimBiosignalDriver {
    pub fn new(spec: SimBiosignalSpec) -> Self {
        Self {
            spec,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> SimBiosignalLog {
        lock(&self.log).clone()
    }
}

impl BiosignalDriver for SimBiosignalDriver {
    fn connect(&self, config: &BiosignalConfig) -> Result<Box<dyn BiosignalDevice>> {
        if !self.spec.attached {
            return Err(BioviewError::connection(&config.name, "Initialization failure: device not found"));
        }
        if !config.device_type.eq_ignore_ascii_case(&self.spec.device_type) {
            return Err(BioviewError::connection(
                &config.name,
                format!(
                    "Initialization failure: expected {}, found {}",
                    config.device_type, self.spec.device_type
                ),
            ));
        }
        let channels = config.enabled_channels();
        if channels.is_empty() {
            return Err(BioviewError::connection(&config.name, "At least one channel must be active"));
        }
        lock(&self.log).connects += 1;

        Ok(Box::new(SimBiosignal {
            spec: self.spec.clone(),
            channels,
            interval_ms: config.sample_interval_ms(),
            next: 0,
            started: None,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Simulated amplifier: a sine of growing amplitude per channel
pub struct SimBiosignal {
    spec: SimBiosignalSpec,
    /// 0-based hardware channels
    channels: Vec<usize>,
    interval_ms: f64,
    /// Index of the next sample
    next: u64,
    started: Option<Instant>,
    log: Arc<Mutex<SimBiosignalLog>>,
}

impl BiosignalDevice for SimBiosignal {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn start_acquisition(&mut self) -> Result<()> {
        let mut log = lock(&self.log);
        log.starts += 1;
        log.acquiring = true;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn most_recent_sample(&mut self, frame: &mut [f64]) -> Result<bool> {
        let Some(started) = self.started else {
            return Err(BioviewError::Hardware("Acquisition not started".into()));
        };
        if frame.len() != self.channels.len() + 1 {
            return Err(BioviewError::Hardware(format!(
                "Frame holds {} values, expected {}",
                frame.len(),
                self.channels.len() + 1
            )));
        }
        if self.spec.fail_after.is_some_and(|n| self.next >= n) {
            return Err(BioviewError::Hardware("Acquisition failure: communication lost".into()));
        }

        let timestamp_ms = self.next as f64 * self.interval_ms;
        if self.spec.realtime && started.elapsed() < Duration::from_secs_f64(timestamp_ms / 1000.0) {
            return Ok(false);
        }

        let t = timestamp_ms / 1000.0;
        frame[0] = timestamp_ms;
        for (value, &chan) in frame[1..].iter_mut().zip(&self.channels) {
            *value = (chan + 1) as f64 * (2.0 * PI * self.spec.signal_hz * t).sin();
        }
        self.next += 1;
        Ok(true)
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        let mut log = lock(&self.log);
        log.stops += 1;
        log.acquiring = false;
        self.started = None;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        lock(&self.log).disconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_checks_device() {
        let config = BiosignalConfig::new("biopac", vec![true, false, true]);
        assert!(SimBiosignalDriver::new(SimBiosignalSpec::detached())
            .connect(&config)
            .is_err());

        let mut wrong = config.clone();
        wrong.device_type = "MP160".into();
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default());
        assert!(driver.connect(&wrong).is_err());

        let device = driver.connect(&config).unwrap();
        assert_eq!(device.num_channels(), 2);
        assert_eq!(driver.log().connects, 1);
    }

    #[test]
    fn test_frames_carry_timestamp_and_channels() {
        let mut config = BiosignalConfig::new("biopac", vec![true, false, true]);
        config.sample_rate = 500.0;
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default());
        let mut device = driver.connect(&config).unwrap();
        let mut frame = vec![0.0; 3];

        assert!(device.most_recent_sample(&mut frame).is_err());
        device.start_acquisition().unwrap();
        assert!(driver.log().acquiring);

        assert!(device.most_recent_sample(&mut frame).unwrap());
        assert_eq!(frame, vec![0.0, 0.0, 0.0]);
        for _ in 0..125 {
            assert!(device.most_recent_sample(&mut frame).unwrap());
        }
        // Sample 125 at 500 Hz is 250 ms in
        assert_eq!(frame[0], 250.0);
        assert!(frame[2].abs() > frame[1].abs());

        assert!(device.most_recent_sample(&mut [0.0; 2]).is_err());
        device.stop_acquisition().unwrap();
        assert!(!driver.log().acquiring);
    }

    #[test]
    fn test_realtime_waits_for_next_sample() {
        let mut config = BiosignalConfig::new("biopac", vec![true]);
        config.sample_rate = 10.0;
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default().with_realtime(true));
        let mut device = driver.connect(&config).unwrap();
        device.start_acquisition().unwrap();

        let mut frame = [0.0; 2];
        assert!(device.most_recent_sample(&mut frame).unwrap());
        // 100 ms per sample: the second is not due yet
        assert!(!device.most_recent_sample(&mut frame).unwrap());
        std::thread::sleep(Duration::from_millis(120));
        assert!(device.most_recent_sample(&mut frame).unwrap());
    }

    #[test]
    fn test_fail_after() {
        let config = BiosignalConfig::new("biopac", vec![true]);
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default().with_fail_after(2));
        let mut device = driver.connect(&config).unwrap();
        device.start_acquisition().unwrap();
        let mut frame = [0.0; 2];
        assert!(device.most_recent_sample(&mut frame).is_ok());
        assert!(device.most_recent_sample(&mut frame).is_ok());
        assert!(device.most_recent_sample(&mut frame).is_err());
    }
}
