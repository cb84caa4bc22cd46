//! Radio hardware capability interface
//!
//! This module provides the traits every radio backend implements, so that the
//! workers and the connection procedure never depend on a particular driver.
//! A deterministic simulated backend lives in [`sim`].
//!
//! # Traits
//!
//! - [`RadioDriver`] - Discovers devices and opens handles
//! - [`RadioHandle`] - Tuning, gain, clocking and stream creation for one device
//! - [`RxStream`] / [`TxStream`] - Streaming objects owned by one worker each
//!
//! Biosignal amplifiers sit behind their own traits in [`biosignal`].
//!
//! Handles are shared (`Arc<dyn RadioHandle>`) between the receive and transmit
//! workers of a device, so every handle method takes `&self`. Streams are owned
//! exclusively and take `&mut self`.

pub mod biosignal;
pub mod sim;

use crate::error::Result;
use num_complex::Complex32;
use std::ops::Sub;
use std::sync::Arc;
use std::time::Duration;

/// Hardware time as whole seconds plus a fractional part
///
/// Splitting the value keeps sub-sample precision for long-running devices.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct TimeSpec {
    full_secs: i64,
    frac_secs: f64,
}

impl TimeSpec {
    /// Create a time spec, normalising the fractional part into `[0, 1)`
    pub fn new(full_secs: i64, frac_secs: f64) -> Self {
        let carry = frac_secs.floor();
        Self {
            full_secs: full_secs + carry as i64,
            frac_secs: frac_secs - carry,
        }
    }

    /// Create from real seconds
    pub fn from_secs(secs: f64) -> Self {
        Self::new(0, secs)
    }

    /// Create from a tick count at the given rate
    pub fn from_ticks(ticks: i64, rate: f64) -> Self {
        let full = (ticks as f64 / rate).floor();
        let frac = (ticks as f64 - full * rate) / rate;
        Self::new(full as i64, frac)
    }

    pub fn full_secs(&self) -> i64 {
        self.full_secs
    }

    pub fn frac_secs(&self) -> f64 {
        self.frac_secs
    }

    /// Time as real seconds (loses precision for very large values)
    pub fn real_secs(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// Convert to a tick count at the given rate
    pub fn to_ticks(&self, rate: f64) -> i64 {
        (self.full_secs as f64 * rate).round() as i64 + (self.frac_secs * rate).round() as i64
    }

    /// Offset by a number of seconds
    pub fn add_secs(self, secs: f64) -> Self {
        Self::new(self.full_secs, self.frac_secs + secs)
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;

    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs - rhs.full_secs, self.frac_secs - rhs.frac_secs)
    }
}

/// Error code attached to every receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxErrorCode {
    /// Samples are valid
    #[default]
    None,
    /// Host could not keep up; samples were dropped before this buffer
    Overflow,
    /// A timed stream command arrived late; the radio core is idle
    Late,
    /// No samples arrived within the timeout
    Timeout,
    /// Any other hardware condition
    Other,
}

impl std::fmt::Display for RxErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RxErrorCode::None => write!(f, "none"),
            RxErrorCode::Overflow => write!(f, "overflow"),
            RxErrorCode::Late => write!(f, "late command"),
            RxErrorCode::Timeout => write!(f, "timeout"),
            RxErrorCode::Other => write!(f, "hardware error"),
        }
    }
}

/// Metadata filled in by [`RxStream::recv`]
#[derive(Debug, Clone, Default)]
pub struct RxMetadata {
    pub error_code: RxErrorCode,
    /// Time of the first sample in the buffer
    pub time_spec: TimeSpec,
    pub has_time_spec: bool,
    /// Backend-specific detail for the error code
    pub message: Option<String>,
}

impl RxMetadata {
    /// Human readable description of the error code
    pub fn strerror(&self) -> String {
        match &self.message {
            Some(detail) => format!("{} ({})", self.error_code, detail),
            None => self.error_code.to_string(),
        }
    }
}

/// Metadata passed to [`TxStream::send`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetadata {
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub has_time_spec: bool,
    pub time_spec: TimeSpec,
}

/// Streaming mode requested from the radio core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    StartContinuous,
    StopContinuous,
}

/// Stream command issued on a receive stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamCommand {
    pub mode: StreamMode,
    /// Start immediately instead of at `time_spec`
    pub stream_now: bool,
    pub time_spec: TimeSpec,
}

impl StreamCommand {
    /// Continuous streaming starting at a hardware time
    pub fn start_at(time_spec: TimeSpec) -> Self {
        Self {
            mode: StreamMode::StartContinuous,
            stream_now: false,
            time_spec,
        }
    }

    /// Stop continuous streaming
    pub fn stop() -> Self {
        Self {
            mode: StreamMode::StopContinuous,
            stream_now: true,
            time_spec: TimeSpec::default(),
        }
    }
}

/// Arguments used to create a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamArgs {
    /// Host sample format, e.g. `fc32`
    pub cpu_format: String,
    /// Over-the-wire sample format, e.g. `sc16`
    pub wire_format: String,
    /// Device-local channels carried by the stream
    pub channels: Vec<usize>,
}

/// A device found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub name: String,
    pub serial: String,
    pub product: String,
}

/// Device discovery and handle creation
pub trait RadioDriver: Send + Sync {
    /// Find devices matching a name (or any device when the hint is empty)
    fn find(&self, name_hint: &str) -> Result<Vec<DeviceAddress>>;

    /// Open a handle to the device with this serial
    fn open(&self, serial: &str) -> Result<Arc<dyn RadioHandle>>;
}

/// Capability interface for one radio device
///
/// # Example
///
/// ```ignore
/// fn tune(radio: &dyn RadioHandle, chans: &[usize], freq: f64) -> Result<()> {
///     for &chan in chans {
///         radio.set_rx_freq(freq, chan)?;
///     }
///     Ok(())
/// }
/// ```
pub trait RadioHandle: Send + Sync {
    /// Number of motherboards behind this handle
    fn num_mboards(&self) -> usize;

    /// Select the receive front-end specification
    fn set_rx_subdev_spec(&self, spec: &str) -> Result<()>;

    /// Select the transmit front-end specification
    fn set_tx_subdev_spec(&self, spec: &str) -> Result<()>;

    /// Set the reference clock source (`None` applies to all boards)
    fn set_clock_source(&self, source: &str, mboard: Option<usize>) -> Result<()>;

    /// Set the time (PPS) source (`None` applies to all boards)
    fn set_time_source(&self, source: &str, mboard: Option<usize>) -> Result<()>;

    /// Read the reference-lock sensor of a board
    fn ref_locked(&self, mboard: usize) -> Result<bool>;

    fn rx_num_channels(&self) -> usize;

    fn tx_num_channels(&self) -> usize;

    fn set_rx_rate(&self, rate: f64, chan: usize) -> Result<()>;

    fn set_rx_freq(&self, freq: f64, chan: usize) -> Result<()>;

    fn set_rx_gain(&self, gain: f64, chan: usize) -> Result<()>;

    fn set_rx_antenna(&self, antenna: &str, chan: usize) -> Result<()>;

    fn set_tx_rate(&self, rate: f64, chan: usize) -> Result<()>;

    fn set_tx_freq(&self, freq: f64, chan: usize) -> Result<()>;

    fn set_tx_gain(&self, gain: f64, chan: usize) -> Result<()>;

    fn set_tx_antenna(&self, antenna: &str, chan: usize) -> Result<()>;

    /// Actual receive sample rate of a channel
    fn rx_rate(&self, chan: usize) -> f64;

    /// Current device time
    fn time_now(&self) -> TimeSpec;

    fn rx_stream(&self, args: &StreamArgs) -> Result<Box<dyn RxStream>>;

    fn tx_stream(&self, args: &StreamArgs) -> Result<Box<dyn TxStream>>;
}

/// Receive stream, owned by a single acquisition worker
pub trait RxStream: Send {
    fn num_channels(&self) -> usize;

    fn max_samps_per_packet(&self) -> usize;

    /// Fill `buffers` (one row per channel) and return the samples written per row
    fn recv(
        &mut self,
        buffers: &mut [Vec<Complex32>],
        metadata: &mut RxMetadata,
        timeout: Duration,
    ) -> Result<usize>;

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()>;
}

/// Transmit stream, owned by a single transmission worker
pub trait TxStream: Send {
    fn num_channels(&self) -> usize;

    fn max_samps_per_packet(&self) -> usize;

    /// Send one row per channel and return the samples accepted per row
    fn send(&mut self, buffers: &[Vec<Complex32>], metadata: &TxMetadata) -> Result<usize>;
}
