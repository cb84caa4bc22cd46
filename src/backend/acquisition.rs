//! Acquisition worker
//!
//! Owns one hardware receive stream and turns it into a sequence of
//! [`RawSampleBuffer`]s on a bounded channel.
//!
//! # Error handling
//!
//! Every receive call reports an [`RxErrorCode`]:
//!
//! - **None**: samples are forwarded. If an overflow was flagged earlier, the
//!   gap between the overflow timestamp and this buffer is counted as dropped.
//! - **Overflow**: the timestamp is recorded and the samples are forwarded.
//! - **Late**: the radio core is idle; streaming is re-armed and whatever was
//!   received is forwarded.
//! - **Timeout / Other**, or a failing receive call: logged, nothing forwarded.
//!
//! A full output channel drops the buffer; the worker never blocks on it.

use super::{Reporter, WorkerControl};
use crate::config::{FIRST_RECV_TIMEOUT, INIT_DELAY};
use crate::error::Result;
use crate::hardware::{RadioHandle, RxErrorCode, RxMetadata, RxStream, StreamCommand, TimeSpec};
use crate::types::RawSampleBuffer;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use num_complex::Complex32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters collected by an acquisition worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Receive calls that returned samples
    pub buffers_received: u64,
    pub buffers_forwarded: u64,
    /// Buffers dropped because the output channel was full
    pub buffers_dropped: u64,
    pub overflows: u64,
    pub late_restarts: u64,
    pub timeouts: u64,
    /// Other hardware errors and failing receive calls
    pub errors: u64,
    /// Samples lost to overflows, from hardware timestamps
    pub samples_dropped: u64,
    pub samples_received: u64,
}

/// Static settings of an acquisition worker
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Device index, stamped on every forwarded buffer
    pub device: usize,
    /// Device name for log messages
    pub name: String,
    /// Device-local receive channels, in stream order
    pub rx_channels: Vec<usize>,
    /// Current gain of each receive channel
    pub gains: Vec<f64>,
    /// Receive buffer length in packets
    pub buffer_packets: usize,
}

/// What happened during one [`AcquisitionWorker::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Buffer handed to the output channel
    Forwarded,
    /// Output channel full; buffer dropped
    QueueFull,
    /// Output channel closed
    Disconnected,
    /// Nothing to forward (no samples, timeout, hardware error)
    Discarded,
}

/// Worker that reads one receive stream
pub struct AcquisitionWorker {
    settings: AcquisitionSettings,
    radio: Arc<dyn RadioHandle>,
    stream: Box<dyn RxStream>,
    output: Sender<RawSampleBuffer>,
    control: Receiver<WorkerControl>,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    sample_rate: f64,
    buffers: Vec<Vec<Complex32>>,
    metadata: RxMetadata,
    timeout: Duration,
    /// Timestamp of the last flagged overflow, cleared by the next good buffer
    overflow_at: Option<TimeSpec>,
    stats: AcquisitionStats,
}

impl AcquisitionWorker {
    pub fn new(
        settings: AcquisitionSettings,
        radio: Arc<dyn RadioHandle>,
        stream: Box<dyn RxStream>,
        output: Sender<RawSampleBuffer>,
        control: Receiver<WorkerControl>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Self {
        let buffer_len = stream.max_samps_per_packet() * settings.buffer_packets.max(1);
        let buffers = vec![vec![Complex32::new(0.0, 0.0); buffer_len]; stream.num_channels()];
        let sample_rate = settings
            .rx_channels
            .first()
            .map(|&chan| radio.rx_rate(chan))
            .unwrap_or(0.0);

        Self {
            settings,
            radio,
            stream,
            output,
            control,
            running,
            reporter,
            sample_rate,
            buffers,
            metadata: RxMetadata::default(),
            timeout: FIRST_RECV_TIMEOUT,
            overflow_at: None,
            stats: AcquisitionStats::default(),
        }
    }

    /// Samples per channel requested from each receive call
    pub fn buffer_len(&self) -> usize {
        self.buffers.first().map(Vec::len).unwrap_or(0)
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    /// Issue a timed start command, INIT_DELAY in the future
    fn arm(&mut self, stream_now: bool) -> Result<()> {
        let mut cmd = StreamCommand::start_at(self.radio.time_now().add_secs(INIT_DELAY.as_secs_f64()));
        cmd.stream_now = stream_now;
        self.stream.issue_stream_cmd(cmd)
    }

    /// Start streaming; all devices use a timed start so their buffers align
    pub fn start(&mut self) -> Result<()> {
        self.arm(false)?;
        self.timeout = FIRST_RECV_TIMEOUT;
        self.reporter
            .debug(format!("[{}] Receiving started", self.settings.name));
        Ok(())
    }

    /// Apply pending control messages
    pub fn process_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(WorkerControl::SetGain(gains)) => self.apply_gains(gains),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply_gains(&mut self, gains: Vec<f64>) {
        if gains.len() != self.settings.rx_channels.len() {
            self.reporter.warn(format!(
                "[{}] Ignoring rx gain update with {} values for {} channels",
                self.settings.name,
                gains.len(),
                self.settings.rx_channels.len()
            ));
            return;
        }
        for (i, (&chan, &gain)) in self.settings.rx_channels.iter().zip(&gains).enumerate() {
            if self.settings.gains.get(i) == Some(&gain) {
                continue;
            }
            if let Err(e) = self.radio.set_rx_gain(gain, chan) {
                self.reporter
                    .error(format!("[{}] Failed to set rx gain on channel {}: {}", self.settings.name, chan, e));
            }
        }
        self.reporter.debug(format!(
            "[{}] Rx gain updated to {:?} (was {:?})",
            self.settings.name, gains, self.settings.gains
        ));
        self.settings.gains = gains;
    }

    /// Perform one receive call and handle its outcome
    pub fn step(&mut self) -> ReadOutcome {
        let received = match self.stream.recv(&mut self.buffers, &mut self.metadata, self.timeout) {
            Ok(n) => n,
            Err(e) => {
                self.stats.errors += 1;
                self.reporter
                    .error(format!("[{}] Receiver runtime error: {}", self.settings.name, e));
                return ReadOutcome::Discarded;
            }
        };
        // Tighten the timeout once the stream is flowing
        self.timeout = INIT_DELAY;

        let forward = match self.metadata.error_code {
            RxErrorCode::None => {
                if let Some(overflow_at) = self.overflow_at.take() {
                    let dropped = (self.metadata.time_spec - overflow_at).to_ticks(self.sample_rate);
                    let dropped = dropped.max(0) as u64;
                    self.stats.samples_dropped += dropped;
                    self.reporter.warn(format!(
                        "[{}] Dropped {} samples after overflow",
                        self.settings.name, dropped
                    ));
                }
                true
            }
            RxErrorCode::Overflow => {
                self.stats.overflows += 1;
                self.overflow_at = Some(self.metadata.time_spec);
                self.reporter.warn(format!(
                    "[{}] Receiver overflow: {}",
                    self.settings.name,
                    self.metadata.strerror()
                ));
                true
            }
            RxErrorCode::Late => {
                self.stats.late_restarts += 1;
                self.reporter.warn(format!(
                    "[{}] Receiver late: {}, restarting",
                    self.settings.name,
                    self.metadata.strerror()
                ));
                let single = self.stream.num_channels() == 1;
                if let Err(e) = self.arm(single) {
                    self.stats.errors += 1;
                    self.reporter
                        .error(format!("[{}] Failed to restart streaming: {}", self.settings.name, e));
                }
                true
            }
            RxErrorCode::Timeout => {
                self.stats.timeouts += 1;
                self.reporter.warn(format!(
                    "[{}] Receiver timeout: {}",
                    self.settings.name,
                    self.metadata.strerror()
                ));
                false
            }
            RxErrorCode::Other => {
                self.stats.errors += 1;
                self.reporter.warn(format!(
                    "[{}] Receiver error: {}",
                    self.settings.name,
                    self.metadata.strerror()
                ));
                false
            }
        };

        if !forward || received == 0 {
            return ReadOutcome::Discarded;
        }

        self.stats.buffers_received += 1;
        self.stats.samples_received += received as u64;

        // Copy so the receive buffers can be reused immediately
        let channels = self
            .buffers
            .iter()
            .map(|row| row[..received.min(row.len())].to_vec())
            .collect();
        let buffer = RawSampleBuffer::new(self.settings.device, self.metadata.time_spec, channels);

        match self.output.try_send(buffer) {
            Ok(()) => {
                self.stats.buffers_forwarded += 1;
                ReadOutcome::Forwarded
            }
            Err(TrySendError::Full(_)) => {
                self.stats.buffers_dropped += 1;
                self.reporter
                    .warn(format!("[{}] Rx queue full, dropping buffer", self.settings.name));
                ReadOutcome::QueueFull
            }
            Err(TrySendError::Disconnected(_)) => ReadOutcome::Disconnected,
        }
    }

    /// Stop streaming
    pub fn stop(&mut self) {
        if let Err(e) = self.stream.issue_stream_cmd(StreamCommand::stop()) {
            self.reporter
                .error(format!("[{}] Failed to stop streaming: {}", self.settings.name, e));
        }
    }

    /// Run until the stop flag clears, then hand the stream back
    pub fn run(mut self) -> (Box<dyn RxStream>, AcquisitionStats) {
        match self.start() {
            Ok(()) => {
                while self.running.load(Ordering::SeqCst) {
                    self.process_control();
                    if self.step() == ReadOutcome::Disconnected {
                        self.reporter
                            .debug(format!("[{}] Rx queue closed", self.settings.name));
                        break;
                    }
                }
            }
            Err(e) => {
                self.reporter
                    .error(format!("[{}] Failed to start streaming: {}", self.settings.name, e));
            }
        }

        self.stop();
        self.reporter.debug(format!(
            "[{}] Receiving stopped ({} buffers, {} dropped samples)",
            self.settings.name, self.stats.buffers_forwarded, self.stats.samples_dropped
        ));
        (self.stream, self.stats)
    }
}
