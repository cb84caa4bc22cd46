//! Transmission worker
//!
//! Re-emits one continuous-tone waveform per transmit channel for as long as
//! the device streams. Every waveform holds a whole number of cycles of every
//! tone, so back-to-back submissions are phase continuous.

use super::{Reporter, WorkerControl};
use crate::config::INIT_DELAY;
use crate::dsp::{generate_tone, waveform_length};
use crate::error::{BioviewError, Result};
use crate::hardware::{RadioHandle, TxMetadata, TxStream};
use crossbeam_channel::{Receiver, TryRecvError};
use num_complex::Complex32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Counters collected by a transmission worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmissionStats {
    pub sends: u64,
    /// Sends that accepted fewer samples than the waveform holds
    pub short_sends: u64,
    pub errors: u64,
    pub samples_sent: u64,
}

/// Static settings of a transmission worker
#[derive(Debug, Clone)]
pub struct TransmissionSettings {
    pub name: String,
    /// Device-local transmit channels, in stream order
    pub tx_channels: Vec<usize>,
    /// Tone frequency of each channel (Hz)
    pub if_freq: Vec<f64>,
    pub amplitudes: Vec<f32>,
    pub gains: Vec<f64>,
    pub sample_rate: f64,
}

/// Worker that drives one transmit stream
pub struct TransmissionWorker {
    settings: TransmissionSettings,
    radio: Arc<dyn RadioHandle>,
    stream: Box<dyn TxStream>,
    control: Receiver<WorkerControl>,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    waveform: Vec<Vec<Complex32>>,
    metadata: TxMetadata,
    stats: TransmissionStats,
}

impl TransmissionWorker {
    /// Build the worker and its waveform
    ///
    /// Fails if the tones cannot share a whole-cycle waveform.
    pub fn new(
        settings: TransmissionSettings,
        radio: Arc<dyn RadioHandle>,
        stream: Box<dyn TxStream>,
        control: Receiver<WorkerControl>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Result<Self> {
        if settings.if_freq.len() != stream.num_channels()
            || settings.amplitudes.len() != stream.num_channels()
        {
            return Err(BioviewError::Config(format!(
                "[{}] {} tones and {} amplitudes for {} transmit channels",
                settings.name,
                settings.if_freq.len(),
                settings.amplitudes.len(),
                stream.num_channels()
            )));
        }

        let len = waveform_length(settings.sample_rate, &settings.if_freq, stream.max_samps_per_packet())?;
        let waveform = settings
            .if_freq
            .iter()
            .zip(&settings.amplitudes)
            .map(|(&freq, &amp)| generate_tone(freq, amp, settings.sample_rate, len))
            .collect();

        Ok(Self {
            settings,
            radio,
            stream,
            control,
            running,
            reporter,
            waveform,
            metadata: TxMetadata::default(),
            stats: TransmissionStats::default(),
        })
    }

    /// Samples per channel in each submission
    pub fn waveform_len(&self) -> usize {
        self.waveform.first().map(Vec::len).unwrap_or(0)
    }

    pub fn waveform(&self) -> &[Vec<Complex32>] {
        &self.waveform
    }

    pub fn stats(&self) -> &TransmissionStats {
        &self.stats
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
        if gains.len() != self.settings.tx_channels.len() {
            self.reporter.warn(format!(
                "[{}] Ignoring tx gain update with {} values for {} channels",
                self.settings.name,
                gains.len(),
                self.settings.tx_channels.len()
            ));
            return;
        }
        for (i, (&chan, &gain)) in self.settings.tx_channels.iter().zip(&gains).enumerate() {
            if self.settings.gains.get(i) == Some(&gain) {
                continue;
            }
            if let Err(e) = self.radio.set_tx_gain(gain, chan) {
                self.reporter
                    .error(format!("[{}] Failed to set tx gain on channel {}: {}", self.settings.name, chan, e));
            }
        }
        self.reporter.debug(format!(
            "[{}] Tx gain updated to {:?} (was {:?})",
            self.settings.name, gains, self.settings.gains
        ));
        self.settings.gains = gains;
    }

    /// Submit the waveform once
    ///
    /// Until a send succeeds, every attempt opens the burst at a start time
    /// taken fresh from the device clock.
    pub fn step(&mut self) {
        if self.stats.sends == 0 {
            self.metadata.start_of_burst = true;
            self.metadata.has_time_spec = true;
            self.metadata.time_spec = self.radio.time_now().add_secs(INIT_DELAY.as_secs_f64());
        }

        match self.stream.send(&self.waveform, &self.metadata) {
            Ok(sent) => {
                self.stats.sends += 1;
                self.stats.samples_sent += sent as u64;
                self.metadata.start_of_burst = false;
                self.metadata.has_time_spec = false;
                let expected = self.waveform_len();
                if sent < expected {
                    self.stats.short_sends += 1;
                    self.reporter.warn(format!(
                        "[{}] Transmit sent {} of {} samples",
                        self.settings.name, sent, expected
                    ));
                }
            }
            Err(e) => {
                self.stats.errors += 1;
                self.reporter
                    .error(format!("[{}] Transmitter runtime error: {}", self.settings.name, e));
            }
        }
    }

    /// Close the burst with a zero-filled buffer
    pub fn end_burst(&mut self) {
        let zeros = vec![vec![Complex32::new(0.0, 0.0); self.waveform_len()]; self.waveform.len()];
        let metadata = TxMetadata {
            end_of_burst: true,
            ..Default::default()
        };
        if let Err(e) = self.stream.send(&zeros, &metadata) {
            self.reporter
                .error(format!("[{}] Failed to end transmit burst: {}", self.settings.name, e));
        }
    }

    /// Run until the stop flag clears, then hand the stream back
    pub fn run(mut self) -> (Box<dyn TxStream>, TransmissionStats) {
        self.reporter.debug(format!(
            "[{}] Transmitting {} channels, waveform length {}",
            self.settings.name,
            self.waveform.len(),
            self.waveform_len()
        ));

        while self.running.load(Ordering::SeqCst) {
            self.process_control();
            self.step();
        }

        self.end_burst();
        self.reporter.debug(format!(
            "[{}] Transmitting stopped after {} sends",
            self.settings.name, self.stats.sends
        ));
        (self.stream, self.stats)
    }
}
