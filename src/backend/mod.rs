//! Backend module for multi-device acquisition and demodulation
//!
//! This module runs the whole real-time pipeline away from any UI. It uses
//! crossbeam channels both between the pipeline stages and for communication
//! with the frontend.
//!
//! # Architecture
//!
//! The backend runs in its own thread, communicating via channels:
//!
//! - [`BackendCommand`] - Messages sent from the frontend (connect, start, configure...)
//! - [`BackendMessage`] - Messages sent to the frontend (status, logs, display data)
//! - [`FrontendHandle`] - Frontend-side handle for sending commands and receiving messages
//! - [`AcquisitionBackend`] - Entry point that owns the command loop
//!
//! # Pipeline
//!
//! Per device, an [`AcquisitionWorker`] and a [`TransmissionWorker`] thread
//! drive the radio. A single [`DemodulationWorker`] consumes one raw buffer per
//! device per cycle and fans processed blocks out to the [`SaveWorker`] and
//! the [`DisplayWorker`]. A configured biosignal amplifier gets its own
//! [`BiosignalWorker`]. The [`DeviceOrchestrator`] owns all of them.
//!
//! # Example
//!
//! ```ignore
//! use bioview_rs::backend::AcquisitionBackend;
//! use bioview_rs::hardware::sim::SimDriver;
//!
//! let (backend, frontend) = AcquisitionBackend::new(config, Arc::new(SimDriver::new()));
//! std::thread::spawn(move || backend.run());
//!
//! frontend.connect();
//! frontend.start();
//! for msg in frontend.drain() {
//!     if let BackendMessage::Display { source, data } = msg {
//!         // Plot data
//!     }
//! }
//! ```

pub mod acquisition;
pub mod biosignal;
pub mod connect;
pub mod demodulation;
pub mod fanout;
pub mod orchestrator;
pub mod transmission;
pub mod worker;

pub use acquisition::{AcquisitionSettings, AcquisitionStats, AcquisitionWorker};
pub use biosignal::{biosignal_sources, BiosignalStats, BiosignalWorker};
pub use connect::{connect_device, DeviceLink};
pub use demodulation::{DemodulationEngine, DemodulationWorker, EngineSettings, EngineStats};
pub use fanout::{BlockSink, DisplayStats, DisplayWorker, SaveStats, SaveWorker};
pub use orchestrator::{DeviceOrchestrator, RunSummary, SinkFactory, WorkerHandle};
pub use transmission::{TransmissionSettings, TransmissionStats, TransmissionWorker};
pub use worker::BackendWorker;

use crate::config::{AddressBook, ExperimentConfig};
use crate::error::{BioviewError, Result};
use crate::hardware::biosignal::BiosignalDriver;
use crate::hardware::RadioDriver;
use crate::types::{ConnectionState, DataSource, DisplayComponent, LogLevel, OutputMode};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Capacity of the frontend display queue
pub const DATA_QUEUE: usize = 10_000;
/// Capacity of the frontend control queue (status, logs, statistics)
pub const CONTROL_QUEUE: usize = 1_000;
/// Longest wait for room in the control queue before an event is given up
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Message sent from the frontend to the backend
#[derive(Debug, Clone)]
pub enum BackendCommand {
    /// Connect every configured device
    Connect,
    /// Start streaming and processing
    Start,
    /// Stop streaming and processing (devices stay connected)
    Stop,
    /// Stop everything and release the hardware
    Disconnect,
    /// Apply a parameter update
    Configure(ParamUpdate),
    /// Enable saving to a path, or disable it with `None`
    SetSave(Option<PathBuf>),
    /// Shutdown the backend
    Shutdown,
}

/// Message sent from the backend to the frontend
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Connection state of a device or of the whole device group
    Status {
        device_id: String,
        state: ConnectionState,
    },
    /// Log event raised by a worker
    Log { level: LogLevel, message: String },
    /// Display series for one source, one row per selected component
    Display {
        source: DataSource,
        data: Vec<Vec<f64>>,
    },
    /// Worker statistics collected when streaming stopped
    Stats(RunSummary),
    /// Backend is shutting down
    Shutdown,
}

/// Control message applied by a streaming worker between hardware calls
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerControl {
    /// New gain for every channel of the stream, in stream channel order
    SetGain(Vec<f64>),
}

/// Typed parameter update
///
/// Device-level parameters are addressed as `<device>.<param>` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamUpdate {
    RxGain { device: String, gains: Vec<f64> },
    TxGain { device: String, gains: Vec<f64> },
    SaveDs(usize),
    DispDs(usize),
    OutputMode(OutputMode),
    DisplayComponent(DisplayComponent),
    DisplaySources(Vec<String>),
    Balance(bool),
    Pairs(Option<Vec<(usize, usize)>>),
}

fn decode<T: serde::de::DeserializeOwned>(param: &str, value: &serde_json::Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| {
        BioviewError::Config(format!("Invalid value {} for {}: {}", value, param, e))
    })
}

impl ParamUpdate {
    /// Parse a wire (name, value) pair into a typed update
    pub fn parse(param: &str, value: &serde_json::Value) -> Result<Self> {
        if let Some((device, name)) = param.split_once('.') {
            let device = device.to_string();
            return match name {
                "rx_gain" => Ok(ParamUpdate::RxGain {
                    device,
                    gains: decode(param, value)?,
                }),
                "tx_gain" => Ok(ParamUpdate::TxGain {
                    device,
                    gains: decode(param, value)?,
                }),
                _ => Err(BioviewError::Config(format!("Unknown device parameter {}", param))),
            };
        }

        match param {
            "save_ds" => Ok(ParamUpdate::SaveDs(decode(param, value)?)),
            "disp_ds" => Ok(ParamUpdate::DispDs(decode(param, value)?)),
            "output_mode" => Ok(ParamUpdate::OutputMode(decode(param, value)?)),
            "display_component" => Ok(ParamUpdate::DisplayComponent(decode(param, value)?)),
            "display_sources" => Ok(ParamUpdate::DisplaySources(decode(param, value)?)),
            "balance" => Ok(ParamUpdate::Balance(decode(param, value)?)),
            "pairs" => Ok(ParamUpdate::Pairs(decode(param, value)?)),
            _ => Err(BioviewError::Config(format!("Unknown parameter {}", param))),
        }
    }

    /// Whether the update can be applied to running workers
    pub fn is_live(&self) -> bool {
        matches!(self, ParamUpdate::RxGain { .. } | ParamUpdate::TxGain { .. })
    }

    /// Apply to a configuration; the configuration is unchanged on error
    pub fn apply(&self, config: &mut ExperimentConfig) -> Result<()> {
        let mut updated = config.clone();
        match self {
            ParamUpdate::RxGain { device, gains } => {
                let dev = updated
                    .device_mut(device)
                    .ok_or_else(|| BioviewError::Config(format!("Unknown device {}", device)))?;
                dev.rx_gain = gains.clone();
            }
            ParamUpdate::TxGain { device, gains } => {
                let dev = updated
                    .device_mut(device)
                    .ok_or_else(|| BioviewError::Config(format!("Unknown device {}", device)))?;
                dev.tx_gain = gains.clone();
            }
            ParamUpdate::SaveDs(ds) => updated.save_ds = *ds,
            ParamUpdate::DispDs(ds) => updated.disp_ds = *ds,
            ParamUpdate::OutputMode(mode) => updated.output_mode = *mode,
            ParamUpdate::DisplayComponent(component) => updated.display_component = *component,
            ParamUpdate::DisplaySources(labels) => updated.display_sources = labels.clone(),
            ParamUpdate::Balance(balance) => updated.balance = *balance,
            ParamUpdate::Pairs(pairs) => updated.pairs = pairs.clone(),
        }
        updated.validate()?;
        *config = updated;
        Ok(())
    }
}

/// Event reporter shared by every worker
///
/// Events are logged through `tracing` and forwarded to the frontend over two
/// queues. Display data goes to the data queue and is dropped when it is full.
/// Status changes, logs, statistics and shutdown go to the control queue, which
/// display traffic cannot fill. Logs never wait; lifecycle events wait up to
/// [`CONTROL_SEND_TIMEOUT`] for room.
#[derive(Debug, Clone)]
pub struct Reporter {
    control: Sender<BackendMessage>,
    data: Sender<BackendMessage>,
}

impl Reporter {
    pub fn new(control: Sender<BackendMessage>, data: Sender<BackendMessage>) -> Self {
        Self { control, data }
    }

    /// A reporter whose events only reach `tracing`
    pub fn detached() -> Self {
        let (control, _) = bounded(1);
        let (data, _) = bounded(1);
        Self { control, data }
    }

    /// Forward a lifecycle event, waiting briefly if the control queue is full
    fn forward_control(&self, msg: BackendMessage) -> bool {
        match self.control.send_timeout(msg, CONTROL_SEND_TIMEOUT) {
            Ok(()) => true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(msg)) => {
                tracing::warn!("Frontend control queue full, dropped {:?}", msg);
                false
            }
            // Nobody listens: detached reporter or frontend gone
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => false,
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        if let Err(TrySendError::Full(_)) = self.control.try_send(BackendMessage::Log { level, message }) {
            tracing::trace!("Frontend control queue full, log message not forwarded");
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn status(&self, device_id: impl Into<String>, state: ConnectionState) {
        let device_id = device_id.into();
        tracing::info!("{}: {}", device_id, state);
        self.forward_control(BackendMessage::Status { device_id, state });
    }

    /// Forward display data; `false` if the data queue was full and it was dropped
    pub fn display(&self, source: DataSource, data: Vec<Vec<f64>>) -> bool {
        !matches!(
            self.data.try_send(BackendMessage::Display { source, data }),
            Err(TrySendError::Full(_))
        )
    }

    pub fn stats(&self, summary: RunSummary) {
        self.forward_control(BackendMessage::Stats(summary));
    }

    pub fn shutdown(&self) {
        if !self.forward_control(BackendMessage::Shutdown) {
            tracing::debug!("Shutdown notice not delivered to the frontend");
        }
    }
}

/// Frontend handle for the backend
pub struct FrontendHandle {
    /// Receiver for status, log, statistics and shutdown messages
    pub receiver: Receiver<BackendMessage>,
    /// Receiver for display data
    pub data_receiver: Receiver<BackendMessage>,
    /// Sender for commands to the backend
    pub command_sender: Sender<BackendCommand>,
}

impl FrontendHandle {
    /// Try to receive a message without blocking, control messages first
    pub fn try_recv(&self) -> Option<BackendMessage> {
        self.receiver
            .try_recv()
            .or_else(|_| self.data_receiver.try_recv())
            .ok()
    }

    /// Wait up to `timeout` for a message from either queue
    pub fn recv_timeout(&self, timeout: Duration) -> Option<BackendMessage> {
        if let Ok(msg) = self.receiver.try_recv() {
            return Some(msg);
        }
        select! {
            recv(self.receiver) -> msg => msg.ok(),
            recv(self.data_receiver) -> msg => msg.ok(),
            default(timeout) => None,
        }
    }

    /// Receive all pending messages, control messages first
    pub fn drain(&self) -> Vec<BackendMessage> {
        let mut messages: Vec<_> = self.receiver.try_iter().collect();
        messages.extend(self.data_receiver.try_iter());
        messages
    }

    /// Send a command to the backend
    pub fn send_command(&self, cmd: BackendCommand) -> bool {
        self.command_sender.send(cmd).is_ok()
    }

    pub fn connect(&self) {
        let _ = self.command_sender.send(BackendCommand::Connect);
    }

    pub fn start(&self) {
        let _ = self.command_sender.send(BackendCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.command_sender.send(BackendCommand::Stop);
    }

    pub fn disconnect(&self) {
        let _ = self.command_sender.send(BackendCommand::Disconnect);
    }

    pub fn set_save(&self, path: Option<PathBuf>) {
        let _ = self.command_sender.send(BackendCommand::SetSave(path));
    }

    /// Parse and send a wire parameter update
    pub fn configure(&self, param: &str, value: &serde_json::Value) -> Result<()> {
        let update = ParamUpdate::parse(param, value)?;
        self.command_sender
            .send(BackendCommand::Configure(update))
            .map_err(|_| BioviewError::Channel("Backend command channel closed".into()))
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(BackendCommand::Shutdown);
    }
}

/// The acquisition backend that runs in a separate thread
pub struct AcquisitionBackend {
    config: ExperimentConfig,
    driver: Arc<dyn RadioDriver>,
    biosignal_driver: Option<Arc<dyn BiosignalDriver>>,
    address_book: Arc<Mutex<AddressBook>>,
    command_receiver: Receiver<BackendCommand>,
    control_sender: Sender<BackendMessage>,
    data_sender: Sender<BackendMessage>,
    running: Arc<AtomicBool>,
}

impl AcquisitionBackend {
    /// Create a new backend with communication channels
    pub fn new(config: ExperimentConfig, driver: Arc<dyn RadioDriver>) -> (Self, FrontendHandle) {
        let (cmd_tx, cmd_rx) = bounded(256);
        // Bounded so a stalled frontend cannot grow memory; display data is dropped instead
        let (data_tx, data_rx) = bounded(DATA_QUEUE);
        let (control_tx, control_rx) = bounded(CONTROL_QUEUE);

        let backend = Self {
            config,
            driver,
            biosignal_driver: None,
            address_book: Arc::new(Mutex::new(AddressBook::in_memory())),
            command_receiver: cmd_rx,
            control_sender: control_tx,
            data_sender: data_tx,
            running: Arc::new(AtomicBool::new(true)),
        };

        let frontend = FrontendHandle {
            receiver: control_rx,
            data_receiver: data_rx,
            command_sender: cmd_tx,
        };

        (backend, frontend)
    }

    /// Use a persistent address book instead of an in-memory one
    pub fn with_address_book(mut self, book: AddressBook) -> Self {
        self.address_book = Arc::new(Mutex::new(book));
        self
    }

    /// Driver for the configured biosignal device
    pub fn with_biosignal_driver(mut self, driver: Arc<dyn BiosignalDriver>) -> Self {
        self.biosignal_driver = Some(driver);
        self
    }

    /// Run the backend loop until shutdown
    pub fn run(self) {
        let reporter = Reporter::new(self.control_sender, self.data_sender);
        let mut orchestrator =
            DeviceOrchestrator::new(self.config, self.driver, self.address_book, reporter.clone());
        if let Some(driver) = self.biosignal_driver {
            orchestrator = orchestrator.with_biosignal_driver(driver);
        }
        let mut worker = BackendWorker::new(orchestrator, self.command_receiver, reporter, self.running);
        worker.run();
    }

    /// Get a handle to stop the backend
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::hardware::sim::SimDriver;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            devices: vec![DeviceConfig::new("usrp0", vec![100e3, 125e3], 2.4e9)],
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_creation() {
        let (backend, frontend) = AcquisitionBackend::new(config(), Arc::new(SimDriver::new()));
        assert!(backend.running.load(Ordering::SeqCst));
        assert!(frontend.send_command(BackendCommand::Shutdown));
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(
            ParamUpdate::parse("usrp0.rx_gain", &json!([10.0, 20.0])).unwrap(),
            ParamUpdate::RxGain {
                device: "usrp0".into(),
                gains: vec![10.0, 20.0]
            }
        );
        assert_eq!(
            ParamUpdate::parse("output_mode", &json!("iq")).unwrap(),
            ParamUpdate::OutputMode(OutputMode::Iq)
        );
        assert_eq!(
            ParamUpdate::parse("pairs", &json!([[0, 1]])).unwrap(),
            ParamUpdate::Pairs(Some(vec![(0, 1)]))
        );
        assert_eq!(
            ParamUpdate::parse("pairs", &json!(null)).unwrap(),
            ParamUpdate::Pairs(None)
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_ill_typed() {
        assert!(ParamUpdate::parse("gain", &json!(1.0)).is_err());
        assert!(ParamUpdate::parse("usrp0.carrier", &json!(1.0)).is_err());
        assert!(ParamUpdate::parse("save_ds", &json!("ten")).is_err());
        assert!(ParamUpdate::parse("save_ds", &json!(-3)).is_err());
        assert!(ParamUpdate::parse("usrp0.tx_gain", &json!({"a": 1})).is_err());
    }

    #[test]
    fn test_apply_validates() {
        let mut config = config();

        ParamUpdate::SaveDs(50).apply(&mut config).unwrap();
        assert_eq!(config.save_ds, 50);

        assert!(ParamUpdate::SaveDs(0).apply(&mut config).is_err());
        assert_eq!(config.save_ds, 50);

        let wrong_len = ParamUpdate::RxGain {
            device: "usrp0".into(),
            gains: vec![1.0],
        };
        assert!(wrong_len.apply(&mut config).is_err());

        let unknown = ParamUpdate::TxGain {
            device: "usrp9".into(),
            gains: vec![1.0, 2.0],
        };
        assert!(unknown.apply(&mut config).is_err());

        let gains = ParamUpdate::TxGain {
            device: "usrp0".into(),
            gains: vec![5.0, 6.0],
        };
        assert!(gains.is_live());
        gains.apply(&mut config).unwrap();
        assert_eq!(config.devices[0].tx_gain, vec![5.0, 6.0]);
    }

    #[test]
    fn test_reporter_logs_without_blocking() {
        let (tx, rx) = bounded(1);
        let (data_tx, _data_rx) = bounded(1);
        let reporter = Reporter::new(tx, data_tx);
        reporter.warn("first");
        reporter.warn("dropped");

        let messages: Vec<_> = rx.try_iter().collect();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            BackendMessage::Log { level: LogLevel::Warning, message } if message == "first"
        ));

        let detached = Reporter::detached();
        detached.error("nobody listens");
        detached.status("usrp0", ConnectionState::Connected);
        detached.shutdown();
    }

    #[test]
    fn test_status_survives_full_display_queue() {
        let (control_tx, control_rx) = bounded(4);
        let (data_tx, data_rx) = bounded(4);
        let reporter = Reporter::new(control_tx, data_tx);
        let source = config().topology().iter().next().cloned().unwrap();

        for _ in 0..4 {
            assert!(reporter.display(source.clone(), vec![vec![1.0]]));
        }
        // The data queue is full: further display data is dropped and reported
        assert!(!reporter.display(source, vec![vec![1.0]]));

        reporter.status("usrp0", ConnectionState::Connected);
        reporter.stats(RunSummary::default());
        reporter.shutdown();

        let control: Vec<_> = control_rx.try_iter().collect();
        assert!(matches!(
            &control[0],
            BackendMessage::Status { device_id, state: ConnectionState::Connected } if device_id == "usrp0"
        ));
        assert!(matches!(control[1], BackendMessage::Stats(_)));
        assert!(matches!(control[2], BackendMessage::Shutdown));
        assert_eq!(data_rx.try_iter().count(), 4);
    }

    #[test]
    fn test_shutdown_gives_up_on_full_control_queue() {
        let (control_tx, control_rx) = bounded(1);
        let (data_tx, _data_rx) = bounded(1);
        let reporter = Reporter::new(control_tx, data_tx);
        reporter.info("fills the queue");

        let started = std::time::Instant::now();
        reporter.shutdown();
        assert!(started.elapsed() < CONTROL_SEND_TIMEOUT * 3);
        assert_eq!(control_rx.try_iter().count(), 1);
    }

    #[test]
    fn test_frontend_receives_from_both_queues() {
        let (backend, frontend) = AcquisitionBackend::new(config(), Arc::new(SimDriver::new()));
        let reporter = Reporter::new(backend.control_sender.clone(), backend.data_sender.clone());
        let source = backend.config.topology().iter().next().cloned().unwrap();

        reporter.display(source, vec![vec![0.5]]);
        reporter.status("usrp0", ConnectionState::Connecting);

        assert!(matches!(
            frontend.recv_timeout(Duration::from_millis(100)),
            Some(BackendMessage::Status { .. })
        ));
        assert!(matches!(
            frontend.recv_timeout(Duration::from_millis(100)),
            Some(BackendMessage::Display { .. })
        ));
        assert!(frontend.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_frontend_configure_rejects_bad_param() {
        let (_backend, frontend) = AcquisitionBackend::new(config(), Arc::new(SimDriver::new()));
        assert!(frontend.configure("nonsense", &json!(1)).is_err());
        assert!(frontend.configure("disp_ds", &json!(4)).is_ok());
    }
}
