//! Simulated radio backend
//!
//! This module provides a radio driver that can be used for testing and for
//! running the pipeline without hardware. Receive streams synthesise loopback
//! tones at configurable IF frequencies, and tests can script the error codes
//! that upcoming receive calls report.
//!
//! # Features
//!
//! - **Tone synthesis**: every receive channel carries the configured tones
//! - **Scripted faults**: queue [`ScriptedRead`] entries (overflow, late, timeout...)
//! - **Inspection**: issued stream commands, applied gains and transmit bursts are logged
//! - **Pacing**: optional real-time pacing so buffers arrive at the sample rate
//!
//! # Example
//!
//! ```ignore
//! use bioview_rs::hardware::sim::{SimDeviceSpec, SimDriver, SimTone};
//!
//! let driver = SimDriver::new().with_device(
//!     SimDeviceSpec::new("usrp0", "3215ABC").with_tones(vec![SimTone::new(100e3, 0.5)]),
//! );
//! let radio = driver.open("3215ABC")?;
//! ```

use super::{
    DeviceAddress, RadioDriver, RadioHandle, RxErrorCode, RxMetadata, RxStream, StreamArgs,
    StreamCommand, StreamMode, TimeSpec, TxMetadata, TxStream,
};
use crate::error::{BioviewError, Result};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default samples per packet of a simulated stream
pub const DEFAULT_SIM_SAMPS_PER_PACKET: usize = 2000;

/// Default seed of the receive noise generator
pub const DEFAULT_SIM_NOISE_SEED: u64 = 0x5EED;

/// A loopback tone present on every simulated receive channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTone {
    /// Frequency in Hz relative to the carrier
    pub freq: f64,
    pub amplitude: f32,
}

impl SimTone {
    pub fn new(freq: f64, amplitude: f32) -> Self {
        Self { freq, amplitude }
    }
}

/// Outcome to report for an upcoming receive call
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedRead {
    /// Normal buffer
    Ok,
    /// Buffer delivered with the overflow flag
    Overflow,
    /// No samples, radio core goes idle until the next start command
    Late,
    /// No samples, timeout reported
    Timeout,
    /// No samples, unclassified hardware error
    Other,
    /// The receive call itself fails
    Fail(String),
    /// Skip this many samples, then deliver a normal buffer
    Gap(u64),
}

/// Static description of a simulated device
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub serial: String,
    pub product: String,
    pub num_mboards: usize,
    pub rx_channels: usize,
    pub tx_channels: usize,
    pub samps_per_packet: usize,
    pub tones: Vec<SimTone>,
    /// Standard deviation of the Gaussian noise added to I and Q (0.0 = none)
    pub noise_amplitude: f32,
    pub noise_seed: u64,
    /// Whether the reference-lock sensor ever reports locked
    pub ref_lockable: bool,
    /// Pace streams at the configured sample rate
    pub realtime: bool,
}

impl SimDeviceSpec {
    /// Create a two-channel device with no tones
    pub fn new(name: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial: serial.into(),
            product: "SIM-2x2".to_string(),
            num_mboards: 1,
            rx_channels: 2,
            tx_channels: 2,
            samps_per_packet: DEFAULT_SIM_SAMPS_PER_PACKET,
            tones: Vec::new(),
            noise_amplitude: 0.0,
            noise_seed: DEFAULT_SIM_NOISE_SEED,
            ref_lockable: true,
            realtime: false,
        }
    }

    pub fn with_tones(mut self, tones: Vec<SimTone>) -> Self {
        self.tones = tones;
        self
    }

    pub fn with_channels(mut self, rx: usize, tx: usize) -> Self {
        self.rx_channels = rx;
        self.tx_channels = tx;
        self
    }

    pub fn with_samps_per_packet(mut self, samps: usize) -> Self {
        self.samps_per_packet = samps.max(1);
        self
    }

    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    pub fn with_noise_seed(mut self, seed: u64) -> Self {
        self.noise_seed = seed;
        self
    }

    pub fn with_mboards(mut self, count: usize) -> Self {
        self.num_mboards = count;
        self
    }

    /// Make the reference-lock sensor never report locked
    pub fn with_unlockable_ref(mut self) -> Self {
        self.ref_lockable = false;
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

/// Record of one transmit call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxRecord {
    pub samples: usize,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub has_time_spec: bool,
    pub all_zero: bool,
}

/// Summary of everything sent on a simulated transmit stream
#[derive(Debug, Clone, Default)]
pub struct TxLog {
    pub sends: u64,
    pub start_bursts: u64,
    pub end_bursts: u64,
    pub first: Option<TxRecord>,
    pub last: Option<TxRecord>,
}

/// Which side of the radio a gain change applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainSide {
    Rx,
    Tx,
}

#[derive(Debug)]
struct SimRadioState {
    rx_rate: Vec<f64>,
    rx_freq: Vec<f64>,
    rx_gain: Vec<f64>,
    rx_antenna: Vec<String>,
    tx_rate: Vec<f64>,
    tx_freq: Vec<f64>,
    tx_gain: Vec<f64>,
    tx_antenna: Vec<String>,
    clock_source: String,
    time_source: String,
    rx_subdev: String,
    tx_subdev: String,
    gain_history: Vec<(GainSide, usize, f64)>,
}

/// Lock a mutex, recovering the data if a previous holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated radio device
pub struct SimRadio {
    spec: SimDeviceSpec,
    start: Instant,
    state: Mutex<SimRadioState>,
    script: Arc<Mutex<VecDeque<ScriptedRead>>>,
    commands: Arc<Mutex<Vec<StreamCommand>>>,
    tx_log: Arc<Mutex<TxLog>>,
}

impl SimRadio {
    /// Create a simulated radio from its spec
    pub fn new(spec: SimDeviceSpec) -> Self {
        let rx = spec.rx_channels;
        let tx = spec.tx_channels;
        Self {
            state: Mutex::new(SimRadioState {
                rx_rate: vec![1e6; rx],
                rx_freq: vec![0.0; rx],
                rx_gain: vec![0.0; rx],
                rx_antenna: vec!["RX2".to_string(); rx],
                tx_rate: vec![1e6; tx],
                tx_freq: vec![0.0; tx],
                tx_gain: vec![0.0; tx],
                tx_antenna: vec!["TX1".to_string(); tx],
                clock_source: "internal".to_string(),
                time_source: "internal".to_string(),
                rx_subdev: String::new(),
                tx_subdev: String::new(),
                gain_history: Vec::new(),
            }),
            spec,
            start: Instant::now(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
            tx_log: Arc::new(Mutex::new(TxLog::default())),
        }
    }

    pub fn spec(&self) -> &SimDeviceSpec {
        &self.spec
    }

    /// Queue the outcome of an upcoming receive call
    pub fn push_script(&self, read: ScriptedRead) {
        lock(&self.script).push_back(read);
    }

    /// Stream commands issued on any receive stream of this radio
    pub fn issued_commands(&self) -> Vec<StreamCommand> {
        lock(&self.commands).clone()
    }

    /// Snapshot of the transmit log
    pub fn tx_log(&self) -> TxLog {
        lock(&self.tx_log).clone()
    }

    pub fn rx_gains(&self) -> Vec<f64> {
        lock(&self.state).rx_gain.clone()
    }

    pub fn tx_gains(&self) -> Vec<f64> {
        lock(&self.state).tx_gain.clone()
    }

    /// Every gain change applied so far, in order
    pub fn gain_history(&self) -> Vec<(GainSide, usize, f64)> {
        lock(&self.state).gain_history.clone()
    }

    pub fn rx_freqs(&self) -> Vec<f64> {
        lock(&self.state).rx_freq.clone()
    }

    pub fn clock_source(&self) -> String {
        lock(&self.state).clock_source.clone()
    }

    pub fn antennas(&self) -> (Vec<String>, Vec<String>) {
        let state = lock(&self.state);
        (state.rx_antenna.clone(), state.tx_antenna.clone())
    }

    fn check_chan(&self, chan: usize, count: usize, side: &str) -> Result<()> {
        if chan >= count {
            return Err(BioviewError::Hardware(format!(
                "{} channel {} out of range (device has {})",
                side, chan, count
            )));
        }
        Ok(())
    }
}

impl RadioHandle for SimRadio {
    fn num_mboards(&self) -> usize {
        self.spec.num_mboards
    }

    fn set_rx_subdev_spec(&self, spec: &str) -> Result<()> {
        lock(&self.state).rx_subdev = spec.to_string();
        Ok(())
    }

    fn set_tx_subdev_spec(&self, spec: &str) -> Result<()> {
        lock(&self.state).tx_subdev = spec.to_string();
        Ok(())
    }

    fn set_clock_source(&self, source: &str, mboard: Option<usize>) -> Result<()> {
        if let Some(board) = mboard {
            if board >= self.spec.num_mboards {
                return Err(BioviewError::Hardware(format!("No motherboard {}", board)));
            }
        }
        lock(&self.state).clock_source = source.to_string();
        Ok(())
    }

    fn set_time_source(&self, source: &str, mboard: Option<usize>) -> Result<()> {
        if let Some(board) = mboard {
            if board >= self.spec.num_mboards {
                return Err(BioviewError::Hardware(format!("No motherboard {}", board)));
            }
        }
        lock(&self.state).time_source = source.to_string();
        Ok(())
    }

    fn ref_locked(&self, mboard: usize) -> Result<bool> {
        if mboard >= self.spec.num_mboards {
            return Err(BioviewError::Hardware(format!("No motherboard {}", mboard)));
        }
        Ok(self.spec.ref_lockable)
    }

    fn rx_num_channels(&self) -> usize {
        self.spec.rx_channels
    }

    fn tx_num_channels(&self) -> usize {
        self.spec.tx_channels
    }

    fn set_rx_rate(&self, rate: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.rx_channels, "Rx")?;
        lock(&self.state).rx_rate[chan] = rate;
        Ok(())
    }

    fn set_rx_freq(&self, freq: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.rx_channels, "Rx")?;
        lock(&self.state).rx_freq[chan] = freq;
        Ok(())
    }

    fn set_rx_gain(&self, gain: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.rx_channels, "Rx")?;
        let mut state = lock(&self.state);
        state.rx_gain[chan] = gain;
        state.gain_history.push((GainSide::Rx, chan, gain));
        Ok(())
    }

    fn set_rx_antenna(&self, antenna: &str, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.rx_channels, "Rx")?;
        lock(&self.state).rx_antenna[chan] = antenna.to_string();
        Ok(())
    }

    fn set_tx_rate(&self, rate: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.tx_channels, "Tx")?;
        lock(&self.state).tx_rate[chan] = rate;
        Ok(())
    }

    fn set_tx_freq(&self, freq: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.tx_channels, "Tx")?;
        lock(&self.state).tx_freq[chan] = freq;
        Ok(())
    }

    fn set_tx_gain(&self, gain: f64, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.tx_channels, "Tx")?;
        let mut state = lock(&self.state);
        state.tx_gain[chan] = gain;
        state.gain_history.push((GainSide::Tx, chan, gain));
        Ok(())
    }

    fn set_tx_antenna(&self, antenna: &str, chan: usize) -> Result<()> {
        self.check_chan(chan, self.spec.tx_channels, "Tx")?;
        lock(&self.state).tx_antenna[chan] = antenna.to_string();
        Ok(())
    }

    fn rx_rate(&self, chan: usize) -> f64 {
        lock(&self.state).rx_rate.get(chan).copied().unwrap_or(0.0)
    }

    fn time_now(&self) -> TimeSpec {
        TimeSpec::from_secs(self.start.elapsed().as_secs_f64())
    }

    fn rx_stream(&self, args: &StreamArgs) -> Result<Box<dyn RxStream>> {
        for &chan in &args.channels {
            self.check_chan(chan, self.spec.rx_channels, "Rx")?;
        }
        let rate = args
            .channels
            .first()
            .map(|&c| self.rx_rate(c))
            .unwrap_or(1e6);
        Ok(Box::new(SimRxStream {
            channels: args.channels.clone(),
            samps_per_packet: self.spec.samps_per_packet,
            rate,
            tones: self.spec.tones.clone(),
            noise: Normal::new(0.0, self.spec.noise_amplitude)
                .ok()
                .filter(|_| self.spec.noise_amplitude > 0.0),
            rng: StdRng::seed_from_u64(self.spec.noise_seed),
            realtime: self.spec.realtime,
            streaming: false,
            sample_index: 0,
            pacing: None,
            script: Arc::clone(&self.script),
            commands: Arc::clone(&self.commands),
        }))
    }

    fn tx_stream(&self, args: &StreamArgs) -> Result<Box<dyn TxStream>> {
        for &chan in &args.channels {
            self.check_chan(chan, self.spec.tx_channels, "Tx")?;
        }
        let rate = {
            let state = lock(&self.state);
            args.channels
                .first()
                .and_then(|&c| state.tx_rate.get(c).copied())
                .unwrap_or(1e6)
        };
        Ok(Box::new(SimTxStream {
            num_channels: args.channels.len(),
            samps_per_packet: self.spec.samps_per_packet,
            rate,
            realtime: self.spec.realtime,
            log: Arc::clone(&self.tx_log),
        }))
    }
}

/// Simulated receive stream
pub struct SimRxStream {
    channels: Vec<usize>,
    samps_per_packet: usize,
    rate: f64,
    tones: Vec<SimTone>,
    /// `None` when the device is noiseless
    noise: Option<Normal<f32>>,
    rng: StdRng,
    realtime: bool,
    streaming: bool,
    /// Tick of the next sample to produce
    sample_index: u64,
    /// Wall-clock anchor for real-time pacing: (instant, tick at that instant)
    pacing: Option<(Instant, u64)>,
    script: Arc<Mutex<VecDeque<ScriptedRead>>>,
    commands: Arc<Mutex<Vec<StreamCommand>>>,
}

impl SimRxStream {
    fn synthesize(&mut self, buffers: &mut [Vec<Complex32>], count: usize) {
        for (row, buffer) in buffers.iter_mut().enumerate() {
            let chan_phase = self.channels.get(row).copied().unwrap_or(row) as f64 * 0.3;
            for (n, sample) in buffer.iter_mut().take(count).enumerate() {
                let t = (self.sample_index + n as u64) as f64 / self.rate;
                let mut acc = Complex32::new(0.0, 0.0);
                for tone in &self.tones {
                    let phase = (2.0 * PI * tone.freq * t + chan_phase) % (2.0 * PI);
                    acc += Complex32::from_polar(tone.amplitude, phase as f32);
                }
                *sample = acc;
            }
        }
        if let Some(noise) = self.noise {
            for buffer in buffers.iter_mut() {
                for sample in buffer.iter_mut().take(count) {
                    let re = noise.sample(&mut self.rng);
                    let im = noise.sample(&mut self.rng);
                    *sample += Complex32::new(re, im);
                }
            }
        }
    }

    fn pace(&mut self, end_tick: u64) {
        if !self.realtime {
            return;
        }
        let (anchor, anchor_tick) = *self
            .pacing
            .get_or_insert_with(|| (Instant::now(), self.sample_index));
        let due = Duration::from_secs_f64(end_tick.saturating_sub(anchor_tick) as f64 / self.rate);
        let elapsed = anchor.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }
}

impl RxStream for SimRxStream {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn max_samps_per_packet(&self) -> usize {
        self.samps_per_packet
    }

    fn recv(
        &mut self,
        buffers: &mut [Vec<Complex32>],
        metadata: &mut RxMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        metadata.message = None;

        if !self.streaming {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            metadata.error_code = RxErrorCode::Timeout;
            metadata.has_time_spec = false;
            return Ok(0);
        }

        let scripted = lock(&self.script).pop_front().unwrap_or(ScriptedRead::Ok);
        let code = match scripted {
            ScriptedRead::Ok => RxErrorCode::None,
            ScriptedRead::Overflow => RxErrorCode::Overflow,
            ScriptedRead::Gap(samples) => {
                self.sample_index += samples;
                self.pacing = None;
                RxErrorCode::None
            }
            ScriptedRead::Late => {
                self.streaming = false;
                metadata.error_code = RxErrorCode::Late;
                metadata.message = Some("stream command arrived late".to_string());
                return Ok(0);
            }
            ScriptedRead::Timeout => {
                metadata.error_code = RxErrorCode::Timeout;
                return Ok(0);
            }
            ScriptedRead::Other => {
                metadata.error_code = RxErrorCode::Other;
                metadata.message = Some("simulated hardware fault".to_string());
                return Ok(0);
            }
            ScriptedRead::Fail(message) => {
                return Err(BioviewError::Hardware(message));
            }
        };

        let capacity = buffers.iter().map(|b| b.len()).min().unwrap_or(0);
        let count = capacity;
        self.synthesize(buffers, count);

        metadata.error_code = code;
        metadata.has_time_spec = true;
        metadata.time_spec = TimeSpec::from_ticks(self.sample_index as i64, self.rate);

        self.sample_index += count as u64;
        self.pace(self.sample_index);
        Ok(count)
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()> {
        lock(&self.commands).push(cmd);
        match cmd.mode {
            StreamMode::StartContinuous => {
                let start_tick = cmd.time_spec.to_ticks(self.rate).max(0) as u64;
                if !cmd.stream_now && start_tick > self.sample_index {
                    self.sample_index = start_tick;
                }
                self.streaming = true;
                self.pacing = None;
            }
            StreamMode::StopContinuous => {
                self.streaming = false;
            }
        }
        Ok(())
    }
}

/// Simulated transmit stream
pub struct SimTxStream {
    num_channels: usize,
    samps_per_packet: usize,
    rate: f64,
    realtime: bool,
    log: Arc<Mutex<TxLog>>,
}

impl TxStream for SimTxStream {
    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn max_samps_per_packet(&self) -> usize {
        self.samps_per_packet
    }

    fn send(&mut self, buffers: &[Vec<Complex32>], metadata: &TxMetadata) -> Result<usize> {
        if buffers.len() != self.num_channels {
            return Err(BioviewError::Hardware(format!(
                "Expected {} transmit rows, got {}",
                self.num_channels,
                buffers.len()
            )));
        }
        let samples = buffers.iter().map(|b| b.len()).min().unwrap_or(0);
        let record = TxRecord {
            samples,
            start_of_burst: metadata.start_of_burst,
            end_of_burst: metadata.end_of_burst,
            has_time_spec: metadata.has_time_spec,
            all_zero: buffers
                .iter()
                .all(|row| row.iter().all(|s| s.re == 0.0 && s.im == 0.0)),
        };
        {
            let mut log = lock(&self.log);
            log.sends += 1;
            if record.start_of_burst {
                log.start_bursts += 1;
            }
            if record.end_of_burst {
                log.end_bursts += 1;
            }
            if log.first.is_none() {
                log.first = Some(record);
            }
            log.last = Some(record);
        }

        let pause = if self.realtime {
            Duration::from_secs_f64(samples as f64 / self.rate)
        } else {
            Duration::from_micros(500)
        };
        std::thread::sleep(pause);
        Ok(samples)
    }
}

/// Driver exposing a fixed set of simulated devices
#[derive(Default)]
pub struct SimDriver {
    specs: Mutex<Vec<SimDeviceSpec>>,
    opened: Mutex<HashMap<String, Arc<SimRadio>>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulated device
    pub fn with_device(self, spec: SimDeviceSpec) -> Self {
        lock(&self.specs).push(spec);
        self
    }

    /// The radio opened for a serial, if any (for inspection in tests)
    pub fn radio(&self, serial: &str) -> Option<Arc<SimRadio>> {
        lock(&self.opened).get(serial).cloned()
    }

    /// The radio opened for a device name, if any
    pub fn radio_by_name(&self, name: &str) -> Option<Arc<SimRadio>> {
        let serial = lock(&self.specs)
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.serial.clone())?;
        self.radio(&serial)
    }
}

impl RadioDriver for SimDriver {
    fn find(&self, name_hint: &str) -> Result<Vec<DeviceAddress>> {
        Ok(lock(&self.specs)
            .iter()
            .filter(|s| name_hint.is_empty() || s.name == name_hint || s.serial == name_hint)
            .map(|s| DeviceAddress {
                name: s.name.clone(),
                serial: s.serial.clone(),
                product: s.product.clone(),
            })
            .collect())
    }

    fn open(&self, serial: &str) -> Result<Arc<dyn RadioHandle>> {
        let spec = lock(&self.specs)
            .iter()
            .find(|s| s.serial == serial)
            .cloned()
            .ok_or_else(|| BioviewError::Hardware(format!("No device with serial {}", serial)))?;
        let radio = Arc::new(SimRadio::new(spec));
        lock(&self.opened).insert(serial.to_string(), Arc::clone(&radio));
        tracing::info!("Simulated radio opened: {}", serial);
        Ok(radio)
    }
}
