//! Core data types for bioview-rs
//!
//! This module contains the data structures that flow between the acquisition,
//! demodulation and fan-out stages.
//!
//! # Main Types
//!
//! - [`DataSource`] - One logical demodulated channel (a Tx/Rx pair)
//! - [`RawSampleBuffer`] - One hardware receive call worth of complex samples
//! - [`ProcessedBlock`] - Demodulated, downsampled output for every source
//! - [`ConnectionState`] - Per-device connection state
//!
//! # Block Layout
//!
//! A [`ProcessedBlock`] is a dense `[source][window][component]` matrix stored
//! row-major. Row order always matches the channel index of the topology that
//! produced it.

use crate::hardware::TimeSpec;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Connection state of a device (or of an aggregate of devices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection procedure in progress
    Connecting,
    /// Connected and ready to stream
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Severity of a log event forwarded to the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Reduction applied to every downsampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// (mean real, mean imaginary)
    Iq,
    /// (mean magnitude, circular mean phase in degrees)
    #[default]
    MagnitudePhase,
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Iq => write!(f, "I/Q"),
            OutputMode::MagnitudePhase => write!(f, "Magnitude/Phase"),
        }
    }
}

/// Which components of a block are forwarded to the display queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayComponent {
    /// Magnitude (or I)
    #[default]
    First,
    /// Phase (or Q)
    Second,
    /// Both components
    Both,
}

impl DisplayComponent {
    /// Component indices selected by this option
    pub fn indices(&self) -> &'static [usize] {
        match self {
            DisplayComponent::First => &[0],
            DisplayComponent::Second => &[1],
            DisplayComponent::Both => &[0, 1],
        }
    }
}

/// One logical demodulated channel
///
/// A source pairs one global transmit channel with one global receive
/// channel. Identity is the owning device plus the dense channel index.
#[derive(Debug, Clone)]
pub struct DataSource {
    /// Name of the device (aggregate) that owns this source
    pub device: Arc<str>,
    /// Dense 0-based channel index, equal to the row in a [`ProcessedBlock`]
    pub channel: usize,
    /// Global transmit channel index
    pub tx_index: usize,
    /// Global receive channel index
    pub rx_index: usize,
    /// Index of the hardware device owning the transmit channel
    pub tx_device: usize,
    /// Index of the hardware device owning the receive channel
    pub rx_device: usize,
    /// Human readable label, e.g. `Tx1Rx2`
    pub label: String,
}

impl DataSource {
    /// True when transmitter and receiver live on the same hardware device
    pub fn is_same_device(&self) -> bool {
        self.tx_device == self.rx_device
    }
}

impl PartialEq for DataSource {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.channel == other.channel
    }
}

impl Eq for DataSource {}

impl Hash for DataSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device.hash(state);
        self.channel.hash(state);
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.device, self.label)
    }
}

/// Raw complex samples from one hardware receive call
#[derive(Debug, Clone)]
pub struct RawSampleBuffer {
    /// Index of the device that produced the buffer
    pub device: usize,
    /// Hardware time of the first sample
    pub time_spec: TimeSpec,
    /// One row of samples per hardware receive channel
    pub channels: Vec<Vec<Complex32>>,
}

impl RawSampleBuffer {
    /// Create a buffer from per-channel rows
    pub fn new(device: usize, time_spec: TimeSpec, channels: Vec<Vec<Complex32>>) -> Self {
        Self {
            device,
            time_spec,
            channels,
        }
    }

    /// Number of receive channels (rows)
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel, or `None` when rows differ in length
    pub fn samples_per_channel(&self) -> Option<usize> {
        let first = self.channels.first()?.len();
        self.channels
            .iter()
            .all(|row| row.len() == first)
            .then_some(first)
    }

    /// Check if the buffer carries no samples at all
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|row| row.is_empty())
    }
}

/// Demodulated output for every source of one processing cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedBlock {
    /// Cycle counter, strictly increasing in emission order
    pub sequence: u64,
    num_sources: usize,
    num_windows: usize,
    num_components: usize,
    data: Vec<f64>,
}

impl ProcessedBlock {
    /// Create a zero-filled block
    pub fn new(sequence: u64, num_sources: usize, num_windows: usize, num_components: usize) -> Self {
        Self {
            sequence,
            num_sources,
            num_windows,
            num_components,
            data: vec![0.0; num_sources * num_windows * num_components],
        }
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources
    }

    pub fn num_windows(&self) -> usize {
        self.num_windows
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    fn offset(&self, source: usize, window: usize, component: usize) -> usize {
        (source * self.num_windows + window) * self.num_components + component
    }

    /// Read a single value
    pub fn get(&self, source: usize, window: usize, component: usize) -> f64 {
        self.data[self.offset(source, window, component)]
    }

    /// Write a single value
    pub fn set(&mut self, source: usize, window: usize, component: usize, value: f64) {
        let idx = self.offset(source, window, component);
        self.data[idx] = value;
    }

    /// Overwrite every value of one source (used to mark failed sources)
    pub fn fill_source(&mut self, source: usize, value: f64) {
        let start = self.offset(source, 0, 0);
        let end = start + self.num_windows * self.num_components;
        self.data[start..end].fill(value);
    }

    /// Time series of one component of one source
    pub fn component(&self, source: usize, component: usize) -> Vec<f64> {
        (0..self.num_windows)
            .map(|w| self.get(source, w, component))
            .collect()
    }

    /// Copy of this block restricted to the selected components
    pub fn select(&self, selection: DisplayComponent) -> ProcessedBlock {
        let indices: Vec<usize> = selection
            .indices()
            .iter()
            .copied()
            .filter(|&c| c < self.num_components)
            .collect();
        let mut out = ProcessedBlock::new(self.sequence, self.num_sources, self.num_windows, indices.len());
        for s in 0..self.num_sources {
            for w in 0..self.num_windows {
                for (dst, &src) in indices.iter().enumerate() {
                    out.set(s, w, dst, self.get(s, w, src));
                }
            }
        }
        out
    }

    /// Flat `[source][window][component]` view
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}
