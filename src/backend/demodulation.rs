//! Demodulation engine
//!
//! Consumes one raw buffer per device per cycle and turns every
//! [`DataSource`](crate::types::DataSource) into a row of windowed baseband
//! values:
//!
//! 1. Continuity check against the last sample seen for the source
//! 2. Butterworth bandpass around the source's IF, state carried across cycles
//! 3. Phase-continuous downconversion to baseband
//! 4. Non-overlapping window reduction (trailing partial window dropped)
//!
//! The engine is a plain state machine; [`DemodulationWorker`] wraps it in the
//! lock-step receive loop and fans blocks out to the save and display queues.

use super::Reporter;
use crate::config::{ExperimentConfig, STALL_WARN_INTERVAL, WORKER_POLL_INTERVAL};
use crate::dsp::{reduce_windows, FilterState, PhaseAccumulator, SosFilter};
use crate::error::{BioviewError, Result};
use crate::topology::ChannelTopology;
use crate::types::{DisplayComponent, OutputMode, ProcessedBlock, RawSampleBuffer};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use num_complex::{Complex32, Complex64};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Samples used to estimate the spread for the continuity check
const CONTINUITY_SAMPLES: usize = 100;

/// Jump size, in standard deviations, reported as a discontinuity
const CONTINUITY_THRESHOLD: f64 = 3.0;

/// Counters collected by the demodulation engine and its worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub blocks_emitted: u64,
    /// Cycles skipped because a raw buffer was malformed
    pub cycles_skipped: u64,
    pub save_dropped: u64,
    pub display_dropped: u64,
    /// Source rows replaced with NaN after a processing error
    pub source_errors: u64,
    pub discontinuities: u64,
    pub stalls: u64,
}

/// Signal parameters of the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// IF of every global transmit channel
    pub channel_ifs: Vec<f64>,
    /// Bandpass width of every global transmit channel
    pub bandwidths: Vec<f64>,
    /// Bandpass order of every global transmit channel
    pub orders: Vec<usize>,
    /// Receive channels delivered by each device, in device order
    pub rx_per_device: Vec<usize>,
    pub sample_rate: f64,
    /// Samples per output window
    pub save_ds: usize,
    pub output_mode: OutputMode,
}

impl EngineSettings {
    pub fn from_experiment(config: &ExperimentConfig) -> Self {
        Self {
            channel_ifs: config.channel_ifs(),
            bandwidths: config.filter_bandwidths(),
            orders: config.filter_orders(),
            rx_per_device: config.devices.iter().map(|d| d.rx_channels.len()).collect(),
            sample_rate: config.sample_rate,
            save_ds: config.save_ds,
            output_mode: config.output_mode,
        }
    }
}

/// Processing state owned by one source
#[derive(Debug, Clone)]
struct SourceState {
    rx_row: usize,
    if_freq: f64,
    filter: SosFilter,
    filter_state: FilterState,
    phase: PhaseAccumulator,
    last_sample: Option<Complex32>,
}

/// Stateful per-source demodulator
pub struct DemodulationEngine {
    topology: ChannelTopology,
    sources: Vec<SourceState>,
    rx_per_device: Vec<usize>,
    sample_rate: f64,
    save_ds: usize,
    output_mode: OutputMode,
    sequence: u64,
    scratch: Vec<Complex64>,
    reporter: Reporter,
    stats: EngineStats,
}

impl DemodulationEngine {
    /// Design every source's filter and zero its state
    pub fn new(topology: ChannelTopology, settings: EngineSettings, reporter: Reporter) -> Result<Self> {
        if settings.save_ds == 0 {
            return Err(BioviewError::Config("Downsample factor must be at least 1".into()));
        }
        let num_rx: usize = settings.rx_per_device.iter().sum();
        if num_rx != topology.num_rx() {
            return Err(BioviewError::Config(format!(
                "Devices deliver {} receive channels, topology expects {}",
                num_rx,
                topology.num_rx()
            )));
        }

        let mut sources = Vec::with_capacity(topology.len());
        for source in &topology {
            let tx = source.tx_index;
            let (Some(&if_freq), Some(&bw), Some(&order)) = (
                settings.channel_ifs.get(tx),
                settings.bandwidths.get(tx),
                settings.orders.get(tx),
            ) else {
                return Err(BioviewError::Config(format!(
                    "No IF settings for transmit channel {} ({})",
                    tx, source.label
                )));
            };
            let filter = SosFilter::bandpass_around(order, if_freq, bw, settings.sample_rate)?;
            sources.push(SourceState {
                rx_row: source.rx_index,
                if_freq,
                filter_state: filter.new_state(),
                filter,
                phase: PhaseAccumulator::new(),
                last_sample: None,
            });
        }

        tracing::debug!(
            "Demodulation engine: {} sources, fs={} Hz, window={}, mode={}",
            sources.len(),
            settings.sample_rate,
            settings.save_ds,
            settings.output_mode
        );

        Ok(Self {
            topology,
            sources,
            rx_per_device: settings.rx_per_device,
            sample_rate: settings.sample_rate,
            save_ds: settings.save_ds,
            output_mode: settings.output_mode,
            sequence: 0,
            scratch: Vec::new(),
            reporter,
            stats: EngineStats::default(),
        })
    }

    /// Build the engine for a validated configuration
    pub fn from_experiment(config: &ExperimentConfig, reporter: Reporter) -> Result<Self> {
        Self::new(config.topology(), EngineSettings::from_experiment(config), reporter)
    }

    pub fn topology(&self) -> &ChannelTopology {
        &self.topology
    }

    pub fn num_devices(&self) -> usize {
        self.rx_per_device.len()
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Sequence number of the next block
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    /// Accumulated oscillator phase of a source
    pub fn phase(&self, channel: usize) -> Option<f64> {
        self.sources.get(channel).map(|s| s.phase.phase())
    }

    /// Check the shape of one cycle and return the shared buffer length
    fn check_cycle(&self, buffers: &[RawSampleBuffer]) -> Result<usize> {
        if buffers.len() != self.rx_per_device.len() {
            return Err(BioviewError::Processing(format!(
                "Expected {} device buffers, got {}",
                self.rx_per_device.len(),
                buffers.len()
            )));
        }

        let mut len = None;
        for (device, (buffer, &expected)) in buffers.iter().zip(&self.rx_per_device).enumerate() {
            if buffer.num_channels() != expected {
                return Err(BioviewError::Processing(format!(
                    "Device {} delivered {} channels, expected {}",
                    device,
                    buffer.num_channels(),
                    expected
                )));
            }
            let n = buffer
                .samples_per_channel()
                .ok_or_else(|| BioviewError::Processing(format!("Device {} delivered ragged rows", device)))?;
            if n == 0 {
                return Err(BioviewError::Processing(format!("Device {} delivered an empty buffer", device)));
            }
            match len {
                None => len = Some(n),
                Some(first) if first != n => {
                    return Err(BioviewError::Processing(format!(
                        "Buffer length mismatch: device {} has {} samples, device 0 has {}",
                        device, n, first
                    )));
                }
                Some(_) => {}
            }
        }
        len.ok_or_else(|| BioviewError::Processing("Empty cycle".into()))
    }

    /// Process one buffer per device, in device order
    ///
    /// A malformed cycle is rejected without touching any source state.
    pub fn process_cycle(&mut self, buffers: &[RawSampleBuffer]) -> Result<ProcessedBlock> {
        let len = match self.check_cycle(buffers) {
            Ok(len) => len,
            Err(e) => {
                self.stats.cycles_skipped += 1;
                return Err(e);
            }
        };

        let rows: Vec<&[Complex32]> = buffers
            .iter()
            .flat_map(|b| b.channels.iter().map(Vec::as_slice))
            .collect();

        let num_windows = len / self.save_ds;
        let mut block = ProcessedBlock::new(self.sequence, self.sources.len(), num_windows, 2);

        for channel in 0..self.sources.len() {
            let row = rows[self.sources[channel].rx_row];
            match self.process_source(channel, row) {
                Ok(windows) => {
                    for (w, (first, second)) in windows.into_iter().enumerate() {
                        block.set(channel, w, 0, first);
                        block.set(channel, w, 1, second);
                    }
                }
                Err(e) => {
                    self.stats.source_errors += 1;
                    block.fill_source(channel, f64::NAN);
                    let label = self.topology.get(channel).map(|s| s.label.as_str()).unwrap_or("?");
                    self.reporter
                        .error(format!("Processing error on {}: {}", label, e));
                }
            }
        }

        self.sequence += 1;
        self.stats.blocks_emitted += 1;
        Ok(block)
    }

    fn process_source(&mut self, channel: usize, row: &[Complex32]) -> Result<Vec<(f64, f64)>> {
        let state = &mut self.sources[channel];

        if let (Some(last), Some(&first)) = (state.last_sample, row.first()) {
            let spread = spread(&row[..row.len().min(CONTINUITY_SAMPLES)]);
            let jump = (first - last).norm() as f64;
            if jump > CONTINUITY_THRESHOLD * spread {
                self.stats.discontinuities += 1;
                self.reporter.warn(format!(
                    "Discontinuity on {}: jump {:.4} exceeds {}σ ({:.4})",
                    self.topology.get(channel).map(|s| s.label.as_str()).unwrap_or("?"),
                    jump,
                    CONTINUITY_THRESHOLD,
                    spread
                ));
            }
        }
        state.last_sample = row.last().copied();

        state.filter.process(row, &mut state.filter_state, &mut self.scratch);
        if self.scratch.iter().any(|s| !s.re.is_finite() || !s.im.is_finite()) {
            state.filter_state.reset();
            return Err(BioviewError::Processing("Filter output is not finite".into()));
        }

        state.phase.mix_down(&mut self.scratch, state.if_freq, self.sample_rate);
        Ok(reduce_windows(&self.scratch, self.save_ds, self.output_mode))
    }
}

/// Standard deviation of complex samples (root mean squared distance to the mean)
fn spread(samples: &[Complex32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples
        .iter()
        .fold(Complex64::new(0.0, 0.0), |acc, s| acc + Complex64::new(s.re as f64, s.im as f64))
        / n;
    let var = samples
        .iter()
        .map(|s| (Complex64::new(s.re as f64, s.im as f64) - mean).norm_sqr())
        .sum::<f64>()
        / n;
    var.sqrt()
}

/// Lock-step receive loop around a [`DemodulationEngine`]
///
/// Each cycle takes exactly one buffer from every device channel, in device
/// order. Channels are polled with a bounded timeout so a cleared stop flag
/// is noticed even while a device is silent.
pub struct DemodulationWorker {
    engine: DemodulationEngine,
    inputs: Vec<Receiver<RawSampleBuffer>>,
    save: Option<Sender<ProcessedBlock>>,
    display: Option<Sender<ProcessedBlock>>,
    display_component: DisplayComponent,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    stall_interval: Duration,
}

impl DemodulationWorker {
    pub fn new(
        engine: DemodulationEngine,
        inputs: Vec<Receiver<RawSampleBuffer>>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Self {
        Self {
            engine,
            inputs,
            save: None,
            display: None,
            display_component: DisplayComponent::default(),
            running,
            reporter,
            stall_interval: STALL_WARN_INTERVAL,
        }
    }

    /// Send every block, both components, to the save queue
    pub fn with_save(mut self, sender: Sender<ProcessedBlock>) -> Self {
        self.save = Some(sender);
        self
    }

    /// Send the selected components of every block to the display queue
    pub fn with_display(mut self, sender: Sender<ProcessedBlock>, component: DisplayComponent) -> Self {
        self.display = Some(sender);
        self.display_component = component;
        self
    }

    pub fn with_stall_interval(mut self, interval: Duration) -> Self {
        self.stall_interval = interval;
        self
    }

    /// Wait for one buffer from a device; `None` once stopped or disconnected
    fn recv_from(&mut self, device: usize) -> Option<RawSampleBuffer> {
        let waiting_since = Instant::now();
        let mut warned = false;

        while self.running.load(Ordering::SeqCst) {
            match self.inputs[device].recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(buffer) => {
                    if warned {
                        self.reporter
                            .info(format!("Device {} resumed after {:.1?}", device, waiting_since.elapsed()));
                    }
                    return Some(buffer);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !warned && waiting_since.elapsed() >= self.stall_interval {
                        warned = true;
                        self.engine.stats.stalls += 1;
                        self.reporter.warn(format!(
                            "Device {} has not delivered data for {:.1?}, pipeline stalled",
                            device,
                            waiting_since.elapsed()
                        ));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.reporter
                        .debug(format!("Raw queue of device {} closed", device));
                    return None;
                }
            }
        }
        None
    }

    fn fan_out(&mut self, block: ProcessedBlock) {
        if let Some(display) = &self.display {
            match display.try_send(block.select(self.display_component)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.engine.stats.display_dropped += 1;
                    self.reporter
                        .warn(format!("Display queue full, dropping block {}", block.sequence));
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.reporter.debug("Display queue closed");
                    self.display = None;
                }
            }
        }

        if let Some(save) = &self.save {
            let sequence = block.sequence;
            match save.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.engine.stats.save_dropped += 1;
                    self.reporter
                        .warn(format!("Save queue full, dropping block {}", sequence));
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.reporter.debug("Save queue closed");
                    self.save = None;
                }
            }
        }
    }

    /// Run until stopped or until a device channel closes
    pub fn run(mut self) -> EngineStats {
        self.reporter.debug(format!(
            "Demodulation started for {} devices, {} sources",
            self.inputs.len(),
            self.engine.topology().len()
        ));

        let mut cycle = Vec::with_capacity(self.inputs.len());
        'cycles: while self.running.load(Ordering::SeqCst) {
            cycle.clear();
            for device in 0..self.inputs.len() {
                match self.recv_from(device) {
                    Some(buffer) => cycle.push(buffer),
                    None => break 'cycles,
                }
            }

            match self.engine.process_cycle(&cycle) {
                Ok(block) => self.fan_out(block),
                Err(e) => self.reporter.warn(format!("Skipping cycle: {}", e)),
            }
        }

        let stats = self.engine.stats.clone();
        self.reporter.debug(format!(
            "Demodulation stopped: {} blocks, {} skipped cycles",
            stats.blocks_emitted, stats.cycles_skipped
        ));
        stats
    }
}
