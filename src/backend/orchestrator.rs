//! Device orchestrator
//!
//! Supervises every device of an experiment and every worker thread of the
//! streaming pipeline.
//!
//! # Connection state
//!
//! Each device moves Disconnected → Connecting → Connected. The aggregate is
//! Connected only when every device is; the first failure reverts all of them
//! to Disconnected and releases whatever was opened. Connection procedures
//! run on their own threads and report back through an event channel that
//! [`DeviceOrchestrator::poll_events`] drains. Every connect attempt carries a
//! number, so results of an abandoned attempt are ignored.
//!
//! # Streaming
//!
//! [`DeviceOrchestrator::start`] lends each device's streams to its workers
//! and spawns, per device, an acquisition and a transmission thread, plus one
//! demodulation thread and the save and display consumers.
//! [`DeviceOrchestrator::stop`] stops producers first, then the engine, then
//! the consumers, and takes the streams back. Connection state is untouched.
//!
//! # Biosignal device
//!
//! A configured biosignal amplifier is a separate child. It connects on its
//! own thread alongside the radios and reports its own status under its name,
//! but its failure never disconnects the radios and it is not part of the
//! aggregate. While streaming it runs its own worker when connected.

use super::connect::{connect_device, DeviceLink};
use super::{
    AcquisitionSettings, AcquisitionStats, AcquisitionWorker, BiosignalStats, BiosignalWorker,
    BlockSink, DemodulationEngine,
    DemodulationWorker, DisplayStats, DisplayWorker, EngineStats, ParamUpdate, Reporter, SaveStats,
    SaveWorker, TransmissionSettings, TransmissionStats, TransmissionWorker, WorkerControl,
};
use crate::config::{AddressBook, ExperimentConfig};
use crate::dsp::{waveform_length, SosFilter};
use crate::error::{BioviewError, Result, ResultExt};
use crate::hardware::biosignal::{BiosignalDevice, BiosignalDriver};
use crate::hardware::{RadioDriver, RxStream, TxStream};
use crate::persistence::{BiosignalCsvSink, CsvBlockSink};
use crate::topology::ChannelTopology;
use crate::types::ConnectionState;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of each worker's control channel
const WORKER_CONTROL_QUEUE: usize = 16;

/// Builds the sink used by the save worker
pub type SinkFactory =
    Box<dyn Fn(&Path, &ChannelTopology, &ExperimentConfig) -> Result<Box<dyn BlockSink>> + Send>;

fn csv_sink_factory() -> SinkFactory {
    Box::new(|path, topology, config| {
        let sink = CsvBlockSink::create(path, topology, config.output_mode)?;
        Ok(Box::new(sink) as Box<dyn BlockSink>)
    })
}

/// A worker thread with its own stop flag
pub struct WorkerHandle<T> {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn a named thread running `f`; the flag is set before the thread starts
    pub fn spawn<F>(name: impl Into<String>, running: Arc<AtomicBool>, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        running.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| BioviewError::Io(e).with_context(format!("Failed to spawn {}", name)))?;
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop; does not wait
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Wait for the worker; `None` if it panicked
    pub fn join(mut self) -> Option<T> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::error!("Worker {} panicked", self.name);
                None
            }
        }
    }
}

/// Statistics of one streaming run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub acquisition: Vec<(String, AcquisitionStats)>,
    pub transmission: Vec<(String, TransmissionStats)>,
    pub engine: EngineStats,
    pub save: Option<SaveStats>,
    pub display: DisplayStats,
    /// Present when the biosignal device streamed
    pub biosignal: Option<BiosignalStats>,
}

impl RunSummary {
    /// Samples lost to overflows across all devices
    pub fn samples_dropped(&self) -> u64 {
        self.acquisition.iter().map(|(_, s)| s.samples_dropped).sum()
    }
}

struct ConnectEvent {
    attempt: u64,
    device: usize,
    result: Result<DeviceLink>,
}

struct DeviceSlot {
    name: String,
    state: ConnectionState,
    link: Option<DeviceLink>,
}

struct BiosignalEvent {
    attempt: u64,
    result: Result<Box<dyn BiosignalDevice>>,
}

struct BiosignalSlot {
    name: String,
    state: ConnectionState,
    device: Option<Box<dyn BiosignalDevice>>,
    attempt: u64,
}

type RxWorker = WorkerHandle<(Box<dyn RxStream>, AcquisitionStats)>;
type TxWorker = WorkerHandle<(Box<dyn TxStream>, TransmissionStats)>;
type BioWorker = WorkerHandle<(Box<dyn BiosignalDevice>, BiosignalStats)>;

/// Running workers of one streaming session
struct Pipeline {
    /// (device index, worker) per device
    acquisition: Vec<(usize, RxWorker)>,
    transmission: Vec<(usize, TxWorker)>,
    rx_controls: Vec<Sender<WorkerControl>>,
    tx_controls: Vec<Sender<WorkerControl>>,
    engine: Option<WorkerHandle<EngineStats>>,
    save: Option<WorkerHandle<SaveStats>>,
    display: Option<WorkerHandle<DisplayStats>>,
    biosignal: Option<BioWorker>,
}

impl Pipeline {
    fn empty() -> Self {
        Self {
            acquisition: Vec::new(),
            transmission: Vec::new(),
            rx_controls: Vec::new(),
            tx_controls: Vec::new(),
            engine: None,
            save: None,
            display: None,
            biosignal: None,
        }
    }
}

/// Supervisor of devices and streaming workers
pub struct DeviceOrchestrator {
    config: ExperimentConfig,
    driver: Arc<dyn RadioDriver>,
    address_book: Arc<Mutex<AddressBook>>,
    reporter: Reporter,
    devices: Vec<DeviceSlot>,
    /// Aggregate state last reported to the frontend
    aggregate: ConnectionState,
    attempt: u64,
    event_tx: Sender<ConnectEvent>,
    event_rx: Receiver<ConnectEvent>,
    pipeline: Option<Pipeline>,
    sink_factory: SinkFactory,
    biosignal_driver: Option<Arc<dyn BiosignalDriver>>,
    biosignal: Option<BiosignalSlot>,
    bio_event_tx: Sender<BiosignalEvent>,
    bio_event_rx: Receiver<BiosignalEvent>,
}

impl DeviceOrchestrator {
    pub fn new(
        config: ExperimentConfig,
        driver: Arc<dyn RadioDriver>,
        address_book: Arc<Mutex<AddressBook>>,
        reporter: Reporter,
    ) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|d| DeviceSlot {
                name: d.name.clone(),
                state: ConnectionState::Disconnected,
                link: None,
            })
            .collect();
        let (event_tx, event_rx) = bounded(256);
        let (bio_event_tx, bio_event_rx) = bounded(16);
        let biosignal = config.biosignal.as_ref().map(|b| BiosignalSlot {
            name: b.name.clone(),
            state: ConnectionState::Disconnected,
            device: None,
            attempt: 0,
        });

        Self {
            config,
            driver,
            address_book,
            reporter,
            devices,
            aggregate: ConnectionState::Disconnected,
            attempt: 0,
            event_tx,
            event_rx,
            pipeline: None,
            sink_factory: csv_sink_factory(),
            biosignal_driver: None,
            biosignal,
            bio_event_tx,
            bio_event_rx,
        }
    }

    /// Driver used to connect the configured biosignal device
    pub fn with_biosignal_driver(mut self, driver: Arc<dyn BiosignalDriver>) -> Self {
        self.biosignal_driver = Some(driver);
        self
    }

    /// Replace the default CSV sink
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn topology(&self) -> ChannelTopology {
        self.config.topology()
    }

    /// Aggregate connection state
    pub fn state(&self) -> ConnectionState {
        self.aggregate
    }

    /// Connection state of every device, in configuration order
    ///
    /// The biosignal device, when configured, comes last.
    pub fn child_states(&self) -> Vec<(String, ConnectionState)> {
        self.devices
            .iter()
            .map(|d| (d.name.clone(), d.state))
            .chain(self.biosignal.iter().map(|b| (b.name.clone(), b.state)))
            .collect()
    }

    /// Connection state of the biosignal device, if one is configured
    pub fn biosignal_state(&self) -> Option<ConnectionState> {
        self.biosignal.as_ref().map(|b| b.state)
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    fn set_child(&mut self, device: usize, state: ConnectionState) {
        if let Some(slot) = self.devices.get_mut(device) {
            if slot.state != state {
                slot.state = state;
                self.reporter.status(slot.name.clone(), state);
            }
        }
    }

    fn set_biosignal(&mut self, state: ConnectionState) {
        if let Some(slot) = self.biosignal.as_mut() {
            if slot.state != state {
                slot.state = state;
                self.reporter.status(slot.name.clone(), state);
            }
        }
    }

    fn update_aggregate(&mut self) {
        let states = self.devices.iter().map(|d| d.state);
        let aggregate = if !self.devices.is_empty() && states.clone().all(|s| s == ConnectionState::Connected) {
            ConnectionState::Connected
        } else if states.clone().any(|s| s == ConnectionState::Connecting) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        };
        if aggregate != self.aggregate {
            self.aggregate = aggregate;
            self.reporter.status(self.config.name.clone(), aggregate);
        }
    }

    /// Start connecting every device without waiting for the result
    pub fn connect(&mut self) -> Result<()> {
        if self.aggregate != ConnectionState::Disconnected {
            return Err(BioviewError::State(format!(
                "Cannot connect while {}",
                self.aggregate
            )));
        }
        self.config.validate()?;

        self.attempt += 1;
        let attempt = self.attempt;
        self.reporter.info(format!(
            "Connecting {} devices (attempt {})",
            self.devices.len(),
            attempt
        ));

        for device in 0..self.devices.len() {
            self.set_child(device, ConnectionState::Connecting);
        }
        self.update_aggregate();

        for (device, device_config) in self.config.devices.iter().enumerate() {
            let driver = Arc::clone(&self.driver);
            let book = Arc::clone(&self.address_book);
            let events = self.event_tx.clone();
            let device_config = device_config.clone();
            let sample_rate = self.config.sample_rate;

            let spawned = std::thread::Builder::new()
                .name(format!("connect-{}", device_config.name))
                .spawn(move || {
                    let result = connect_device(driver.as_ref(), &device_config, sample_rate, &book);
                    let _ = events.send(ConnectEvent {
                        attempt,
                        device,
                        result,
                    });
                });
            if let Err(e) = spawned {
                let _ = self.event_tx.try_send(ConnectEvent {
                    attempt,
                    device,
                    result: Err(BioviewError::Io(e)),
                });
            }
        }
        self.connect_biosignal();
        Ok(())
    }

    /// Start connecting the biosignal device unless it is connected or connecting
    fn connect_biosignal(&mut self) {
        let Some(config) = self.config.biosignal.clone() else {
            return;
        };
        let Some(slot) = self.biosignal.as_mut() else {
            return;
        };
        if slot.state != ConnectionState::Disconnected {
            return;
        }
        slot.attempt += 1;
        let attempt = slot.attempt;
        self.set_biosignal(ConnectionState::Connecting);

        let Some(driver) = self.biosignal_driver.clone() else {
            let _ = self.bio_event_tx.try_send(BiosignalEvent {
                attempt,
                result: Err(BioviewError::connection(&config.name, "No biosignal driver available")),
            });
            return;
        };
        let events = self.bio_event_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("connect-{}", config.name))
            .spawn(move || {
                let result = driver.connect(&config);
                let _ = events.send(BiosignalEvent { attempt, result });
            });
        if let Err(e) = spawned {
            let _ = self.bio_event_tx.try_send(BiosignalEvent {
                attempt,
                result: Err(BioviewError::Io(e)),
            });
        }
    }

    fn poll_biosignal_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.bio_event_rx.try_recv() {
            handled += 1;
            let current = self.biosignal.as_ref().map(|b| b.attempt);
            if current != Some(event.attempt) {
                tracing::debug!("Ignoring result of superseded biosignal attempt {}", event.attempt);
                continue;
            }
            match event.result {
                Ok(device) => {
                    if let Some(slot) = self.biosignal.as_mut() {
                        slot.device = Some(device);
                    }
                    self.set_biosignal(ConnectionState::Connected);
                }
                Err(e) => {
                    self.reporter.error(format!("Biosignal connection failed: {}", e));
                    self.set_biosignal(ConnectionState::Disconnected);
                }
            }
        }
        handled
    }

    /// Close the biosignal device and mark it Disconnected
    fn release_biosignal(&mut self) {
        let Some(slot) = self.biosignal.as_mut() else {
            return;
        };
        slot.attempt += 1;
        if let Some(mut device) = slot.device.take() {
            if let Err(e) = device.disconnect() {
                self.reporter
                    .info(format!("{} connection already closed: {}", slot.name, e));
            }
        }
        self.set_biosignal(ConnectionState::Disconnected);
    }

    /// Apply finished connection results; returns the number of events handled
    pub fn poll_events(&mut self) -> usize {
        let mut handled = self.poll_biosignal_events();
        loop {
            let event = match self.event_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            handled += 1;

            if event.attempt != self.attempt {
                tracing::debug!("Ignoring result of superseded connect attempt {}", event.attempt);
                continue;
            }

            match event.result {
                Ok(link) => {
                    if let Some(slot) = self.devices.get_mut(event.device) {
                        slot.link = Some(link);
                    }
                    self.set_child(event.device, ConnectionState::Connected);
                }
                Err(e) => {
                    self.reporter.error(format!("Connection failed: {}", e));
                    self.release_devices();
                }
            }
            self.update_aggregate();
        }
        handled
    }

    /// Poll until the aggregate leaves Connecting or the timeout passes
    pub fn wait_for_connection(&mut self, timeout: Duration) -> ConnectionState {
        let start = Instant::now();
        loop {
            self.poll_events();
            if self.aggregate != ConnectionState::Connecting || start.elapsed() >= timeout {
                return self.aggregate;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Drop every link and mark every device Disconnected
    fn release_devices(&mut self) {
        // Later results of this attempt must not revive it
        self.attempt += 1;
        for device in 0..self.devices.len() {
            self.devices[device].link = None;
            self.set_child(device, ConnectionState::Disconnected);
        }
    }

    /// Spawn the streaming pipeline beneath the connected devices
    pub fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            self.reporter.info("Already streaming");
            return Ok(());
        }
        if self.aggregate != ConnectionState::Connected {
            return Err(BioviewError::State(format!("Cannot start while {}", self.aggregate)));
        }

        // Everything that can fail is checked before any stream is lent out
        let topology = self.config.topology();
        let engine = DemodulationEngine::from_experiment(&self.config, self.reporter.clone())?;
        let sink = match &self.config.save_path {
            Some(path) => Some(
                (self.sink_factory)(path, &topology, &self.config)
                    .with_context(|| format!("Cannot save to {}", path.display()))?,
            ),
            None => None,
        };
        let display_filter = match &self.config.display_filter {
            Some(f) => Some(SosFilter::butterworth_lowpass(f.order, f.cutoff_hz, self.config.display_rate())?),
            None => None,
        };
        let biosignal_ready = self
            .biosignal
            .as_ref()
            .is_some_and(|b| b.state == ConnectionState::Connected && b.device.is_some());
        let biosignal_sink = match (&self.config.biosignal, self.config.biosignal_save_path()) {
            (Some(bio), Some(path)) if biosignal_ready => Some(
                BiosignalCsvSink::create(&path, &super::biosignal_sources(bio), bio.sample_rate)
                    .with_context(|| format!("Cannot save to {}", path.display()))?,
            ),
            _ => None,
        };
        if self.biosignal.is_some() && !biosignal_ready {
            self.reporter
                .warn("Biosignal device is not connected; streaming radios only");
        }
        for (slot, device) in self.devices.iter().zip(&self.config.devices) {
            let link = slot
                .link
                .as_ref()
                .ok_or_else(|| BioviewError::State(format!("{} has no open handle", slot.name)))?;
            let tx = link.tx_stream.as_ref().ok_or_else(|| {
                BioviewError::State(format!("{} lost its transmit stream; reconnect", slot.name))
            })?;
            if link.rx_stream.is_none() {
                return Err(BioviewError::State(format!(
                    "{} lost its receive stream; reconnect",
                    slot.name
                )));
            }
            waveform_length(self.config.sample_rate, &device.if_freq, tx.max_samps_per_packet())?;
        }

        let mut pipeline = Pipeline::empty();
        let spawned = self
            .spawn_pipeline(&mut pipeline, engine, &topology, sink, display_filter)
            .and_then(|()| {
                if biosignal_ready {
                    self.spawn_biosignal(&mut pipeline, biosignal_sink)
                } else {
                    Ok(())
                }
            });
        match spawned {
            Ok(()) => {
                self.pipeline = Some(pipeline);
                self.reporter.info(format!(
                    "Streaming started: {} devices, {} sources",
                    self.devices.len(),
                    topology.len()
                ));
                Ok(())
            }
            Err(e) => {
                self.teardown(pipeline);
                Err(e)
            }
        }
    }

    fn spawn_biosignal(&mut self, pipeline: &mut Pipeline, sink: Option<BiosignalCsvSink>) -> Result<()> {
        let (Some(config), Some(slot)) = (self.config.biosignal.as_ref(), self.biosignal.as_mut()) else {
            return Ok(());
        };
        let Some(device) = slot.device.take() else {
            return Err(BioviewError::State(format!("{} has no open device", slot.name)));
        };
        let flag = Arc::new(AtomicBool::new(true));
        let mut worker = BiosignalWorker::new(config, device, flag.clone(), self.reporter.clone());
        if let Some(sink) = sink {
            worker = worker.with_sink(sink);
        }
        pipeline.biosignal = Some(WorkerHandle::spawn(
            format!("bio-{}", config.name),
            flag,
            move || worker.run(),
        )?);
        Ok(())
    }

    fn spawn_pipeline(
        &mut self,
        pipeline: &mut Pipeline,
        engine: DemodulationEngine,
        topology: &ChannelTopology,
        sink: Option<Box<dyn BlockSink>>,
        display_filter: Option<SosFilter>,
    ) -> Result<()> {
        let queues = self.config.queues;

        // Consumers first, so the engine never pushes into a queue nobody drains
        let (display_tx, display_rx) = bounded(queues.display);
        let flag = Arc::new(AtomicBool::new(true));
        let mut display = DisplayWorker::new(
            topology,
            &self.config.display_sources,
            self.config.disp_ds,
            display_rx,
            flag.clone(),
            self.reporter.clone(),
        );
        if let Some(filter) = display_filter {
            display = display.with_filter(filter);
        }
        pipeline.display = Some(WorkerHandle::spawn("display", flag, move || display.run())?);

        let save_tx = match sink {
            Some(sink) => {
                let (save_tx, save_rx) = bounded(queues.save);
                let flag = Arc::new(AtomicBool::new(true));
                let worker = SaveWorker::new(sink, save_rx, flag.clone(), self.reporter.clone());
                pipeline.save = Some(WorkerHandle::spawn("save", flag, move || worker.run())?);
                Some(save_tx)
            }
            None => None,
        };

        let mut raw_inputs = Vec::with_capacity(self.devices.len());
        let mut raw_outputs = Vec::with_capacity(self.devices.len());
        for _ in 0..self.devices.len() {
            let (tx, rx) = bounded(queues.raw);
            raw_outputs.push(tx);
            raw_inputs.push(rx);
        }

        let flag = Arc::new(AtomicBool::new(true));
        let mut demod = DemodulationWorker::new(engine, raw_inputs, flag.clone(), self.reporter.clone())
            .with_display(display_tx, self.config.display_component);
        if let Some(save_tx) = save_tx {
            demod = demod.with_save(save_tx);
        }
        pipeline.engine = Some(WorkerHandle::spawn("demodulation", flag, move || demod.run())?);

        for (index, raw_tx) in raw_outputs.into_iter().enumerate() {
            let device = &self.config.devices[index];
            let Some(link) = self.devices[index].link.as_mut() else {
                return Err(BioviewError::State(format!("{} has no open handle", device.name)));
            };
            let (Some(rx_stream), Some(tx_stream)) = (link.rx_stream.take(), link.tx_stream.take()) else {
                return Err(BioviewError::State(format!("{} has no streams", device.name)));
            };
            let radio = Arc::clone(&link.radio);

            let (tx_ctl, tx_ctl_rx) = bounded(WORKER_CONTROL_QUEUE);
            let flag = Arc::new(AtomicBool::new(true));
            let transmitter = match TransmissionWorker::new(
                TransmissionSettings {
                    name: device.name.clone(),
                    tx_channels: device.tx_channels.clone(),
                    if_freq: device.if_freq.clone(),
                    amplitudes: device.tx_amplitude.clone(),
                    gains: device.tx_gain.clone(),
                    sample_rate: self.config.sample_rate,
                },
                Arc::clone(&radio),
                tx_stream,
                tx_ctl_rx,
                flag.clone(),
                self.reporter.clone(),
            ) {
                Ok(worker) => worker,
                Err(e) => {
                    link.rx_stream = Some(rx_stream);
                    return Err(e);
                }
            };
            pipeline.tx_controls.push(tx_ctl);
            pipeline.transmission.push((
                index,
                WorkerHandle::spawn(format!("tx-{}", device.name), flag, move || transmitter.run())?,
            ));

            let (rx_ctl, rx_ctl_rx) = bounded(WORKER_CONTROL_QUEUE);
            let flag = Arc::new(AtomicBool::new(true));
            let receiver = AcquisitionWorker::new(
                AcquisitionSettings {
                    device: index,
                    name: device.name.clone(),
                    rx_channels: device.rx_channels.clone(),
                    gains: device.rx_gain.clone(),
                    buffer_packets: self.config.buffer_packets,
                },
                radio,
                rx_stream,
                raw_tx,
                rx_ctl_rx,
                flag.clone(),
                self.reporter.clone(),
            );
            pipeline.rx_controls.push(rx_ctl);
            pipeline.acquisition.push((
                index,
                WorkerHandle::spawn(format!("rx-{}", device.name), flag, move || receiver.run())?,
            ));
        }
        Ok(())
    }

    /// Stop and join every worker of a pipeline, returning streams to their links
    fn teardown(&mut self, pipeline: Pipeline) -> RunSummary {
        let mut summary = RunSummary::default();

        // Producers first
        for (_, worker) in &pipeline.acquisition {
            worker.stop();
        }
        for (_, worker) in &pipeline.transmission {
            worker.stop();
        }
        for (index, worker) in pipeline.acquisition {
            let name = worker.name().to_string();
            match worker.join() {
                Some((stream, stats)) => {
                    if let Some(link) = self.devices.get_mut(index).and_then(|d| d.link.as_mut()) {
                        link.rx_stream = Some(stream);
                    }
                    summary.acquisition.push((self.devices[index].name.clone(), stats));
                }
                None => self.reporter.error(format!("{} exited abnormally", name)),
            }
        }
        for (index, worker) in pipeline.transmission {
            let name = worker.name().to_string();
            match worker.join() {
                Some((stream, stats)) => {
                    if let Some(link) = self.devices.get_mut(index).and_then(|d| d.link.as_mut()) {
                        link.tx_stream = Some(stream);
                    }
                    summary.transmission.push((self.devices[index].name.clone(), stats));
                }
                None => self.reporter.error(format!("{} exited abnormally", name)),
            }
        }
        drop(pipeline.rx_controls);
        drop(pipeline.tx_controls);

        if let Some(worker) = pipeline.biosignal {
            worker.stop();
            let name = worker.name().to_string();
            match worker.join() {
                Some((device, stats)) => {
                    if let Some(slot) = self.biosignal.as_mut() {
                        slot.device = Some(device);
                    }
                    summary.biosignal = Some(stats);
                }
                None => self.reporter.error(format!("{} exited abnormally", name)),
            }
        }

        if let Some(engine) = pipeline.engine {
            engine.stop();
            summary.engine = engine.join().unwrap_or_default();
        }
        if let Some(save) = pipeline.save {
            save.stop();
            summary.save = save.join();
        }
        if let Some(display) = pipeline.display {
            display.stop();
            summary.display = display.join().unwrap_or_default();
        }
        summary
    }

    /// Stop streaming; a no-op when nothing is running
    pub fn stop(&mut self) -> Option<RunSummary> {
        let Some(pipeline) = self.pipeline.take() else {
            tracing::debug!("Stop requested while not streaming");
            return None;
        };

        let summary = self.teardown(pipeline);
        self.reporter.info(format!(
            "Streaming stopped: {} blocks, {} skipped cycles, {} samples dropped",
            summary.engine.blocks_emitted,
            summary.engine.cycles_skipped,
            summary.samples_dropped()
        ));
        self.reporter.stats(summary.clone());
        Some(summary)
    }

    /// Stop streaming and release every device; legal in any state
    pub fn disconnect(&mut self) {
        self.stop();
        self.release_devices();
        self.release_biosignal();
        self.update_aggregate();
    }

    /// Apply a parameter update, forwarding gains to running workers
    ///
    /// The stored configuration changes only once a live update has reached
    /// its worker.
    pub fn configure(&mut self, update: ParamUpdate) -> Result<()> {
        let mut updated = self.config.clone();
        update.apply(&mut updated)?;

        let live = match (&update, &self.pipeline) {
            (ParamUpdate::RxGain { device, gains }, Some(pipeline)) => self
                .device_index(device)
                .and_then(|i| pipeline.acquisition.iter().position(|(d, _)| *d == i))
                .map(|slot| (&pipeline.rx_controls[slot], gains.clone())),
            (ParamUpdate::TxGain { device, gains }, Some(pipeline)) => self
                .device_index(device)
                .and_then(|i| pipeline.transmission.iter().position(|(d, _)| *d == i))
                .map(|slot| (&pipeline.tx_controls[slot], gains.clone())),
            _ => None,
        };

        match live {
            Some((control, gains)) => match control.try_send(WorkerControl::SetGain(gains)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return Err(BioviewError::Channel("Worker control queue full".into()));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(BioviewError::Channel("Worker has exited".into()));
                }
            },
            None if self.pipeline.is_some() && !update.is_live() => {
                self.reporter
                    .info(format!("{:?} takes effect on the next start", update));
            }
            None => {}
        }

        self.config = updated;
        self.reporter.debug(format!("Applied {:?}", update));
        Ok(())
    }

    fn device_index(&self, name: &str) -> Option<usize> {
        self.config.devices.iter().position(|d| d.name == name)
    }

    /// Set or clear the save path used by the next start
    pub fn set_save_path(&mut self, path: Option<PathBuf>) {
        match &path {
            Some(p) => self.reporter.info(format!("Saving to {}", p.display())),
            None => self.reporter.info("Saving disabled"),
        }
        if self.pipeline.is_some() {
            self.reporter.info("Save path applies on the next start");
        }
        self.config.save_path = path;
    }
}

impl Drop for DeviceOrchestrator {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.teardown(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendMessage;
    use crate::config::DeviceConfig;
    use crate::hardware::sim::{SimDeviceSpec, SimDriver, SimTone};
    use crate::hardware::RadioHandle;
    use crate::types::ProcessedBlock;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(devices: &[&str]) -> ExperimentConfig {
        ExperimentConfig {
            sample_rate: 1e6,
            buffer_packets: 2,
            devices: devices
                .iter()
                .map(|name| DeviceConfig::new(*name, vec![100e3, 125e3], 2.4e9))
                .collect(),
            ..Default::default()
        }
    }

    fn driver(specs: Vec<SimDeviceSpec>) -> Arc<SimDriver> {
        let mut driver = SimDriver::new();
        for spec in specs {
            driver = driver.with_device(
                spec.with_tones(vec![SimTone::new(100e3, 0.5), SimTone::new(125e3, 0.5)])
                    .with_samps_per_packet(500)
                    .with_realtime(true),
            );
        }
        Arc::new(driver)
    }

    fn orchestrator(
        config: ExperimentConfig,
        driver: Arc<SimDriver>,
    ) -> (DeviceOrchestrator, Receiver<BackendMessage>) {
        let (tx, rx) = bounded(10_000);
        let orch = DeviceOrchestrator::new(
            config,
            driver,
            Arc::new(Mutex::new(AddressBook::in_memory())),
            Reporter::new(tx.clone(), tx),
        );
        (orch, rx)
    }

    /// Sink collecting sequences in memory
    struct MemorySink(Arc<Mutex<Vec<u64>>>);

    impl BlockSink for MemorySink {
        fn write(&mut self, block: &ProcessedBlock) -> Result<()> {
            self.0.lock().unwrap().push(block.sequence);
            Ok(())
        }
    }

    #[test]
    fn test_connect_all_devices() {
        let (mut orch, rx) = orchestrator(
            config(&["usrp0", "usrp1"]),
            driver(vec![SimDeviceSpec::new("usrp0", "A1"), SimDeviceSpec::new("usrp1", "B2")]),
        );
        assert_eq!(orch.state(), ConnectionState::Disconnected);

        orch.connect().unwrap();
        assert_eq!(orch.state(), ConnectionState::Connecting);
        assert_eq!(orch.wait_for_connection(WAIT), ConnectionState::Connected);
        assert!(orch
            .child_states()
            .iter()
            .all(|(_, s)| *s == ConnectionState::Connected));

        // Connect is only legal from Disconnected
        assert!(orch.connect().is_err());

        let aggregate: Vec<ConnectionState> = rx
            .try_iter()
            .filter_map(|m| match m {
                BackendMessage::Status { device_id, state } if device_id == "multi_usrp" => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(aggregate, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    }

    #[test]
    fn test_child_failure_disconnects_all() {
        // usrp1 is not attached
        let (mut orch, _rx) = orchestrator(
            config(&["usrp0", "usrp1"]),
            driver(vec![SimDeviceSpec::new("usrp0", "A1")]),
        );
        orch.connect().unwrap();
        assert_eq!(orch.wait_for_connection(WAIT), ConnectionState::Disconnected);
        assert!(orch
            .child_states()
            .iter()
            .all(|(_, s)| *s == ConnectionState::Disconnected));

        // Late results of the failed attempt are ignored
        std::thread::sleep(Duration::from_millis(50));
        orch.poll_events();
        assert_eq!(orch.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_start_requires_connection() {
        let (mut orch, _rx) = orchestrator(config(&["usrp0"]), driver(vec![SimDeviceSpec::new("usrp0", "A1")]));
        assert!(orch.start().is_err());
        assert!(!orch.is_running());
        assert!(orch.stop().is_none());
    }

    #[test]
    fn test_stream_stop_and_restart() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink_store = saved.clone();
        let mut cfg = config(&["usrp0"]);
        cfg.save_path = Some(PathBuf::from("memory"));
        let (orch, _rx) = orchestrator(cfg, driver(vec![SimDeviceSpec::new("usrp0", "A1")]));
        let mut orch = orch.with_sink_factory(Box::new(move |_, _, _| {
            Ok(Box::new(MemorySink(sink_store.clone())) as Box<dyn BlockSink>)
        }));

        orch.connect().unwrap();
        assert_eq!(orch.wait_for_connection(WAIT), ConnectionState::Connected);

        orch.start().unwrap();
        assert!(orch.is_running());
        // Second start is a no-op
        orch.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let summary = orch.stop().unwrap();
        assert!(orch.stop().is_none());
        assert_eq!(orch.state(), ConnectionState::Connected);
        assert!(summary.engine.blocks_emitted > 0);
        assert_eq!(summary.save.as_ref().map(|s| s.written), Some(summary.engine.blocks_emitted));

        let sequences = saved.lock().unwrap().clone();
        assert_eq!(sequences, (0..sequences.len() as u64).collect::<Vec<_>>());

        // Streams were handed back, so streaming can resume
        orch.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        orch.disconnect();
        assert!(!orch.is_running());
        assert_eq!(orch.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_gain_update_reaches_running_worker() {
        let drv = driver(vec![SimDeviceSpec::new("usrp0", "A1")]);
        let (mut orch, _rx) = orchestrator(config(&["usrp0"]), drv.clone());
        orch.connect().unwrap();
        orch.wait_for_connection(WAIT);
        orch.start().unwrap();

        orch.configure(ParamUpdate::RxGain {
            device: "usrp0".into(),
            gains: vec![12.0, 0.0],
        })
        .unwrap();
        assert!(orch
            .configure(ParamUpdate::TxGain {
                device: "usrp0".into(),
                gains: vec![1.0],
            })
            .is_err());

        let radio = drv.radio("A1").unwrap();
        let start = Instant::now();
        while radio.rx_gains()[0] != 12.0 && start.elapsed() < WAIT {
            std::thread::sleep(Duration::from_millis(5));
        }
        orch.stop();
        assert_eq!(radio.rx_gains(), vec![12.0, 0.0]);
        assert_eq!(orch.config().devices[0].rx_gain, vec![12.0, 0.0]);
    }

    #[test]
    fn test_undelivered_gain_leaves_config_unchanged() {
        let (mut orch, _rx) = orchestrator(config(&["usrp0"]), driver(vec![SimDeviceSpec::new("usrp0", "A1")]));
        let radio = crate::hardware::sim::SimRadio::new(SimDeviceSpec::new("usrp0", "A1"));
        let stream = radio
            .rx_stream(&crate::hardware::StreamArgs {
                cpu_format: "fc32".into(),
                wire_format: "sc16".into(),
                channels: vec![0, 1],
            })
            .unwrap();
        let worker = WorkerHandle::spawn("usrp0-rx", Arc::new(AtomicBool::new(true)), move || {
            (stream, AcquisitionStats::default())
        })
        .unwrap();

        // A worker whose control queue is already full
        let (control_tx, _control_rx) = bounded(1);
        control_tx.send(WorkerControl::SetGain(vec![1.0, 1.0])).unwrap();
        let mut pipeline = Pipeline::empty();
        pipeline.acquisition.push((0, worker));
        pipeline.rx_controls.push(control_tx);
        orch.pipeline = Some(pipeline);

        let before = orch.config().devices[0].rx_gain.clone();
        let result = orch.configure(ParamUpdate::RxGain {
            device: "usrp0".into(),
            gains: vec![9.0, 9.0],
        });
        assert!(matches!(result, Err(BioviewError::Channel(_))));
        assert_eq!(orch.config().devices[0].rx_gain, before);

        assert!(orch.stop().is_some());
    }

    fn with_biosignal(mut cfg: ExperimentConfig) -> ExperimentConfig {
        let mut bio = crate::config::BiosignalConfig::new("biopac", vec![true, true]);
        bio.batch = 10;
        cfg.biosignal = Some(bio);
        cfg
    }

    fn wait_for_biosignal(orch: &mut DeviceOrchestrator) -> Option<ConnectionState> {
        let start = Instant::now();
        while orch.biosignal_state() == Some(ConnectionState::Connecting) && start.elapsed() < WAIT {
            orch.poll_events();
            std::thread::sleep(Duration::from_millis(5));
        }
        orch.biosignal_state()
    }

    #[test]
    fn test_biosignal_streams_beside_radios() {
        use crate::hardware::biosignal::{SimBiosignalDriver, SimBiosignalSpec};

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = with_biosignal(config(&["usrp0"]));
        cfg.save_path = Some(dir.path().join("run.csv"));
        let bio_driver = Arc::new(SimBiosignalDriver::new(SimBiosignalSpec::default().with_realtime(true)));
        let (orch, rx) = orchestrator(cfg, driver(vec![SimDeviceSpec::new("usrp0", "A1")]));
        let mut orch = orch.with_biosignal_driver(bio_driver.clone());

        orch.connect().unwrap();
        assert_eq!(orch.wait_for_connection(WAIT), ConnectionState::Connected);
        assert_eq!(wait_for_biosignal(&mut orch), Some(ConnectionState::Connected));
        assert_eq!(
            orch.child_states().last(),
            Some(&("biopac".to_string(), ConnectionState::Connected))
        );

        orch.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let summary = orch.stop().unwrap();
        let bio = summary.biosignal.expect("biosignal stats");
        assert!(bio.samples > 0);
        assert_eq!(bio.rows_saved, bio.samples);
        assert!(!bio_driver.log().acquiring);

        let saved = std::fs::read_to_string(dir.path().join("run_biopac.csv")).unwrap();
        assert_eq!(saved.lines().nth(1), Some("timestamp_ms,Ch1,Ch2"));
        assert_eq!(saved.lines().skip(2).count() as u64, bio.samples);
        assert!(rx.try_iter().any(|m| matches!(
            m,
            BackendMessage::Display { source, .. } if source.label == "Ch2"
        )));

        // The device was handed back and is closed on disconnect
        orch.disconnect();
        assert_eq!(orch.biosignal_state(), Some(ConnectionState::Disconnected));
        assert_eq!(bio_driver.log().disconnects, 1);
    }

    #[test]
    fn test_biosignal_failure_leaves_radios_connected() {
        use crate::hardware::biosignal::{SimBiosignalDriver, SimBiosignalSpec};

        let (orch, rx) = orchestrator(
            with_biosignal(config(&["usrp0"])),
            driver(vec![SimDeviceSpec::new("usrp0", "A1")]),
        );
        let mut orch = orch.with_biosignal_driver(Arc::new(SimBiosignalDriver::new(SimBiosignalSpec::detached())));

        orch.connect().unwrap();
        assert_eq!(orch.wait_for_connection(WAIT), ConnectionState::Connected);
        assert_eq!(wait_for_biosignal(&mut orch), Some(ConnectionState::Disconnected));
        assert_eq!(orch.state(), ConnectionState::Connected);
        assert!(rx.try_iter().any(|m| matches!(
            m,
            BackendMessage::Log { message, .. } if message.contains("Biosignal connection failed")
        )));

        // Radios stream on their own
        orch.start().unwrap();
        let summary = orch.stop().unwrap();
        assert!(summary.biosignal.is_none());
    }

    #[test]
    fn test_disconnect_from_any_state() {
        let (mut orch, _rx) = orchestrator(config(&["usrp0"]), driver(vec![SimDeviceSpec::new("usrp0", "A1")]));
        orch.disconnect();
        assert_eq!(orch.state(), ConnectionState::Disconnected);

        orch.connect().unwrap();
        orch.disconnect();
        assert_eq!(orch.state(), ConnectionState::Disconnected);

        // The abandoned attempt cannot connect the device later
        std::thread::sleep(Duration::from_millis(100));
        orch.poll_events();
        assert_eq!(orch.state(), ConnectionState::Disconnected);
    }
}
