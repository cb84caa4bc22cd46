//! Configuration module for bioview-rs
//!
//! This module handles experiment configuration:
//! - Shared acquisition settings (sample rate, downsampling, output mode)
//! - Per-device radio settings (IFs, gains, channels, clocking)
//! - The device address book (name → serial cache)
//!
//! Configurations load from TOML or JSON, chosen by file extension, and are
//! validated once with [`ExperimentConfig::validate`] before any worker is
//! built from them.
//!
//! # Example
//!
//! ```ignore
//! use bioview_rs::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::load("experiment.toml")?;
//! let topology = config.topology();
//! println!("{} data sources at {} Hz", topology.len(), config.sample_rate);
//! ```

pub mod address_book;

pub use address_book::AddressBook;

use crate::error::{BioviewError, Result};
use crate::topology::{ChannelTopology, DeviceChannels};
use crate::types::{DisplayComponent, OutputMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "org.bioview.bioview-rs";

/// Delay between "now" and the first timed stream or burst
pub const INIT_DELAY: Duration = Duration::from_millis(50);

/// Receive timeout before the first buffer has arrived
pub const FIRST_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for an external reference to lock
pub const CLOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Receive buffer length in packets
pub const DEFAULT_BUFFER_PACKETS: usize = 20;

/// A device silent for this long produces a stall warning
pub const STALL_WARN_INTERVAL: Duration = Duration::from_secs(2);

/// Poll interval of blocking channel reads that must observe a stop flag
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_SAMPLE_RATE: f64 = 1e6;
pub const DEFAULT_SAVE_DS: usize = 100;
pub const DEFAULT_DISP_DS: usize = 10;
pub const DEFAULT_IF_FILTER_BW: f64 = 5e3;
pub const DEFAULT_FILTER_ORDER: usize = 2;

/// Analog channels of a biosignal amplifier
pub const BIOSIGNAL_MAX_CHANNELS: usize = 16;
pub const DEFAULT_BIOSIGNAL_RATE: f64 = 1000.0;
/// Samples gathered before a save/display flush
pub const DEFAULT_BIOSIGNAL_BATCH: usize = 50;

// ==================== Queue Capacities ====================

/// Bounded queue capacities between pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Raw buffers per device between acquisition and demodulation
    pub raw: usize,
    /// Processed blocks waiting for the save sink
    pub save: usize,
    /// Processed blocks waiting for the display worker
    pub display: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            raw: 64,
            save: 256,
            display: 64,
        }
    }
}

// ==================== Display Filter ====================

/// Optional lowpass applied to displayed series after display decimation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayFilterConfig {
    pub cutoff_hz: f64,
    #[serde(default = "default_filter_order")]
    pub order: usize,
}

fn default_filter_order() -> usize {
    DEFAULT_FILTER_ORDER
}

// ==================== Biosignal Config ====================

/// Settings of the biosignal amplifier running beside the radios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiosignalConfig {
    /// Device name, owner of the `Ch{n}` sources
    pub name: String,
    /// Amplifier model, e.g. `MP36`
    pub device_type: String,
    /// Enabled flag per hardware channel, channel 1 first
    pub channels: Vec<bool>,
    /// Samples per second
    pub sample_rate: f64,
    /// Samples per save/display batch
    pub batch: usize,
}

impl Default for BiosignalConfig {
    fn default() -> Self {
        Self {
            name: "biopac".to_string(),
            device_type: "MP36".to_string(),
            channels: vec![true],
            sample_rate: DEFAULT_BIOSIGNAL_RATE,
            batch: DEFAULT_BIOSIGNAL_BATCH,
        }
    }
}

impl BiosignalConfig {
    pub fn new(name: impl Into<String>, channels: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            channels,
            ..Default::default()
        }
    }

    /// Time between samples in milliseconds
    pub fn sample_interval_ms(&self) -> f64 {
        1000.0 / self.sample_rate
    }

    /// 0-based hardware numbers of the enabled channels
    pub fn enabled_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i)
            .collect()
    }

    /// Enable mask padded to every hardware channel
    pub fn channel_mask(&self) -> [bool; BIOSIGNAL_MAX_CHANNELS] {
        let mut mask = [false; BIOSIGNAL_MAX_CHANNELS];
        for (slot, &on) in mask.iter_mut().zip(&self.channels) {
            *slot = on;
        }
        mask
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BioviewError::Config("Biosignal device needs a name".into()));
        }
        if self.channels.len() > BIOSIGNAL_MAX_CHANNELS {
            return Err(BioviewError::Config(format!(
                "[{}] {} channels configured, the amplifier has {}",
                self.name,
                self.channels.len(),
                BIOSIGNAL_MAX_CHANNELS
            )));
        }
        if !self.channels.iter().any(|&on| on) {
            return Err(BioviewError::Config(format!(
                "[{}] At least one channel must be active",
                self.name
            )));
        }
        if !(self.sample_rate > 0.0) {
            return Err(BioviewError::Config(format!(
                "[{}] Sample rate must be positive, got {}",
                self.name, self.sample_rate
            )));
        }
        if self.batch == 0 {
            return Err(BioviewError::Config(format!("[{}] batch must be at least 1", self.name)));
        }
        Ok(())
    }
}

// ==================== Device Config ====================

/// IF filter bandwidth: one value for every channel or one per transmit channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterBandwidth {
    Shared(f64),
    PerChannel(Vec<f64>),
}

impl Default for FilterBandwidth {
    fn default() -> Self {
        FilterBandwidth::Shared(DEFAULT_IF_FILTER_BW)
    }
}

/// Settings of one radio device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name used for discovery and in the address book
    pub name: String,

    /// IF frequency of each transmit channel (Hz, whole numbers)
    pub if_freq: Vec<f64>,

    /// Carrier (center) frequency in Hz
    pub carrier_freq: f64,

    #[serde(default)]
    pub rx_gain: Vec<f64>,

    #[serde(default)]
    pub tx_gain: Vec<f64>,

    #[serde(default)]
    pub if_filter_bw: FilterBandwidth,

    #[serde(default = "default_filter_order")]
    pub filter_order: usize,

    #[serde(default = "default_amplitudes")]
    pub tx_amplitude: Vec<f32>,

    #[serde(default = "default_channels")]
    pub rx_channels: Vec<usize>,

    #[serde(default = "default_channels")]
    pub tx_channels: Vec<usize>,

    #[serde(default = "default_subdev")]
    pub rx_subdev: String,

    #[serde(default = "default_subdev")]
    pub tx_subdev: String,

    #[serde(default = "default_cpu_format")]
    pub cpu_format: String,

    #[serde(default = "default_wire_format")]
    pub wire_format: String,

    /// Reference clock source (`internal`, `external`, `gpsdo`, `mimo`)
    #[serde(default = "default_internal")]
    pub clock: String,

    /// Time (PPS) source
    #[serde(default = "default_internal")]
    pub pps: String,
}

fn default_amplitudes() -> Vec<f32> {
    vec![1.0, 1.0]
}

fn default_channels() -> Vec<usize> {
    vec![0, 1]
}

fn default_subdev() -> String {
    "A:A A:B".to_string()
}

fn default_cpu_format() -> String {
    "fc32".to_string()
}

fn default_wire_format() -> String {
    "sc16".to_string()
}

fn default_internal() -> String {
    "internal".to_string()
}

impl DeviceConfig {
    /// Create a two-channel device with default gains and clocking
    pub fn new(name: impl Into<String>, if_freq: Vec<f64>, carrier_freq: f64) -> Self {
        Self {
            name: name.into(),
            if_freq,
            carrier_freq,
            rx_gain: vec![0.0; 2],
            tx_gain: vec![0.0; 2],
            if_filter_bw: FilterBandwidth::default(),
            filter_order: DEFAULT_FILTER_ORDER,
            tx_amplitude: default_amplitudes(),
            rx_channels: default_channels(),
            tx_channels: default_channels(),
            rx_subdev: default_subdev(),
            tx_subdev: default_subdev(),
            cpu_format: default_cpu_format(),
            wire_format: default_wire_format(),
            clock: default_internal(),
            pps: default_internal(),
        }
    }

    /// Restrict the device to the given local channels
    ///
    /// Per-channel gains and amplitudes are resized to match.
    pub fn with_channels(mut self, rx: Vec<usize>, tx: Vec<usize>) -> Self {
        self.rx_gain.resize(rx.len(), 0.0);
        self.tx_gain.resize(tx.len(), 0.0);
        self.tx_amplitude.resize(tx.len(), 1.0);
        self.rx_channels = rx;
        self.tx_channels = tx;
        self
    }

    pub fn with_gains(mut self, rx_gain: Vec<f64>, tx_gain: Vec<f64>) -> Self {
        self.rx_gain = rx_gain;
        self.tx_gain = tx_gain;
        self
    }

    pub fn with_filter_bw(mut self, bw: FilterBandwidth) -> Self {
        self.if_filter_bw = bw;
        self
    }

    /// Filter bandwidth of each transmit channel
    pub fn filter_bandwidths(&self) -> Vec<f64> {
        match &self.if_filter_bw {
            FilterBandwidth::Shared(bw) => vec![*bw; self.tx_channels.len()],
            FilterBandwidth::PerChannel(bws) => bws.clone(),
        }
    }

    fn validate(&self, sample_rate: f64) -> Result<()> {
        let err = |msg: String| Err(BioviewError::Config(format!("Device {}: {}", self.name, msg)));

        if self.name.is_empty() {
            return Err(BioviewError::Config("Device name must not be empty".into()));
        }
        if self.rx_channels.is_empty() || self.tx_channels.is_empty() {
            return err("at least one rx and one tx channel are required".into());
        }
        if self.if_freq.len() != self.tx_channels.len() {
            return err(format!(
                "{} IF frequencies for {} tx channels",
                self.if_freq.len(),
                self.tx_channels.len()
            ));
        }
        if self.tx_gain.len() != self.tx_channels.len() {
            return err(format!("{} tx gains for {} tx channels", self.tx_gain.len(), self.tx_channels.len()));
        }
        if self.rx_gain.len() != self.rx_channels.len() {
            return err(format!("{} rx gains for {} rx channels", self.rx_gain.len(), self.rx_channels.len()));
        }
        if self.tx_amplitude.len() != self.tx_channels.len() {
            return err(format!(
                "{} tx amplitudes for {} tx channels",
                self.tx_amplitude.len(),
                self.tx_channels.len()
            ));
        }
        if self.filter_order == 0 {
            return err("filter order must be at least 1".into());
        }
        let bws = self.filter_bandwidths();
        if bws.len() != self.tx_channels.len() {
            return err(format!("{} filter bandwidths for {} tx channels", bws.len(), self.tx_channels.len()));
        }
        for (&freq, &bw) in self.if_freq.iter().zip(&bws) {
            if freq.fract() != 0.0 {
                return err(format!("IF {} Hz is not a whole number", freq));
            }
            if !(bw > 0.0 && freq - bw / 2.0 > 0.0 && freq + bw / 2.0 < sample_rate / 2.0) {
                return err(format!(
                    "IF band {} ± {} Hz does not fit below Nyquist ({} Hz)",
                    freq,
                    bw / 2.0,
                    sample_rate / 2.0
                ));
            }
        }
        Ok(())
    }
}

// ==================== Experiment Config ====================

/// Complete acquisition configuration for a group of devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Name of the device group, used as the owner of every data source
    pub name: String,

    /// Shared sample rate of every device (Hz, whole number)
    pub sample_rate: f64,

    /// Samples per output window of the demodulator
    pub save_ds: usize,

    /// Additional decimation applied to displayed series
    pub disp_ds: usize,

    pub output_mode: OutputMode,

    pub display_component: DisplayComponent,

    pub display_filter: Option<DisplayFilterConfig>,

    /// Labels of the sources sent to the display (empty = all)
    pub display_sources: Vec<String>,

    /// Use every other channel only
    pub balance: bool,

    /// Allowed cross-device pairs (None = every pair allowed)
    pub pairs: Option<Vec<(usize, usize)>>,

    /// Receive buffer length in packets
    pub buffer_packets: usize,

    pub queues: QueueConfig,

    /// Save path for processed blocks (None = saving disabled)
    pub save_path: Option<PathBuf>,

    pub devices: Vec<DeviceConfig>,

    /// Biosignal amplifier recorded beside the radios
    pub biosignal: Option<BiosignalConfig>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "multi_usrp".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            save_ds: DEFAULT_SAVE_DS,
            disp_ds: DEFAULT_DISP_DS,
            output_mode: OutputMode::default(),
            display_component: DisplayComponent::default(),
            display_filter: None,
            display_sources: Vec::new(),
            balance: false,
            pairs: None,
            buffer_packets: DEFAULT_BUFFER_PACKETS,
            queues: QueueConfig::default(),
            save_path: None,
            devices: Vec::new(),
            biosignal: None,
        }
    }
}

impl ExperimentConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from TOML (`.toml`) or JSON (anything else)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BioviewError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                BioviewError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                BioviewError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save the configuration, format chosen by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BioviewError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| BioviewError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| BioviewError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            BioviewError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check every setting once, before any worker is built
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate > 0.0) || self.sample_rate.fract() != 0.0 {
            return Err(BioviewError::Config(format!(
                "Sample rate must be a positive whole number, got {}",
                self.sample_rate
            )));
        }
        if self.save_ds == 0 {
            return Err(BioviewError::Config("save_ds must be at least 1".into()));
        }
        if self.disp_ds == 0 {
            return Err(BioviewError::Config("disp_ds must be at least 1".into()));
        }
        if self.buffer_packets == 0 {
            return Err(BioviewError::Config("buffer_packets must be at least 1".into()));
        }
        if self.queues.raw == 0 || self.queues.save == 0 || self.queues.display == 0 {
            return Err(BioviewError::Config("Queue capacities must be at least 1".into()));
        }
        if self.devices.is_empty() {
            return Err(BioviewError::Config("At least one device is required".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(BioviewError::Config(format!("Duplicate device name {}", device.name)));
            }
            device.validate(self.sample_rate)?;
        }

        if let Some(pairs) = &self.pairs {
            for &(a, b) in pairs {
                if a >= self.devices.len() || b >= self.devices.len() {
                    return Err(BioviewError::Config(format!(
                        "Pair ({}, {}) refers to a missing device",
                        a, b
                    )));
                }
            }
        }

        if let Some(filter) = &self.display_filter {
            let nyquist = self.display_rate() / 2.0;
            if filter.order == 0 || !(filter.cutoff_hz > 0.0 && filter.cutoff_hz < nyquist) {
                return Err(BioviewError::Config(format!(
                    "Display filter cutoff {} Hz must lie in (0, {}) Hz",
                    filter.cutoff_hz, nyquist
                )));
            }
        }

        if let Some(biosignal) = &self.biosignal {
            biosignal.validate()?;
            if biosignal.name == self.name || self.device(&biosignal.name).is_some() {
                return Err(BioviewError::Config(format!(
                    "Biosignal device name {} is already in use",
                    biosignal.name
                )));
            }
        }

        let topology = self.topology();
        for label in &self.display_sources {
            if topology.find(label).is_none() {
                return Err(BioviewError::Config(format!("Unknown display source {}", label)));
            }
        }

        Ok(())
    }

    /// Build the channel topology described by this configuration
    pub fn topology(&self) -> ChannelTopology {
        let channels: Vec<DeviceChannels> = self
            .devices
            .iter()
            .map(|d| DeviceChannels::new(d.rx_channels.len(), d.tx_channels.len()))
            .collect();
        ChannelTopology::build(&self.name, &channels, self.balance, self.pairs.as_deref())
    }

    /// IF frequency of every global transmit channel
    pub fn channel_ifs(&self) -> Vec<f64> {
        self.devices.iter().flat_map(|d| d.if_freq.iter().copied()).collect()
    }

    /// IF filter bandwidth of every global transmit channel
    pub fn filter_bandwidths(&self) -> Vec<f64> {
        self.devices.iter().flat_map(|d| d.filter_bandwidths()).collect()
    }

    /// IF filter order of every global transmit channel
    pub fn filter_orders(&self) -> Vec<usize> {
        self.devices
            .iter()
            .flat_map(|d| std::iter::repeat(d.filter_order).take(d.tx_channels.len()))
            .collect()
    }

    /// Rate of processed blocks (windows per second)
    pub fn block_rate(&self) -> f64 {
        self.sample_rate / self.save_ds as f64
    }

    /// Rate of displayed series
    pub fn display_rate(&self) -> f64 {
        self.sample_rate / (self.save_ds * self.disp_ds) as f64
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut DeviceConfig> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    /// Biosignal save file: `<stem>_<device>.csv` beside the radio save file
    pub fn biosignal_save_path(&self) -> Option<PathBuf> {
        let path = self.save_path.as_ref()?;
        let biosignal = self.biosignal.as_ref()?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("session");
        Some(path.with_file_name(format!("{}_{}.csv", stem, biosignal.name)))
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}
