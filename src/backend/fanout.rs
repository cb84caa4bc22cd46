//! Fan-out consumers for processed blocks
//!
//! The demodulation worker pushes every block to two bounded queues without
//! blocking. Each queue is drained by its own worker thread:
//!
//! - [`SaveWorker`] hands blocks to a [`BlockSink`] (e.g. a CSV file)
//! - [`DisplayWorker`] decimates the selected sources further, optionally
//!   smooths them, and forwards series to the frontend

use super::Reporter;
use crate::config::WORKER_POLL_INTERVAL;
use crate::dsp::{FilterState, SosFilter};
use crate::error::Result;
use crate::topology::ChannelTopology;
use crate::types::{DataSource, ProcessedBlock};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Destination for processed blocks
///
/// Implementations own their storage. Failures are reported back to the
/// save worker, which logs them and carries on with the next block.
pub trait BlockSink: Send {
    fn write(&mut self, block: &ProcessedBlock) -> Result<()>;

    /// Flush buffered output; called once when saving stops
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counters collected by the save worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub written: u64,
    pub failed: u64,
}

/// Worker draining the save queue into a sink
pub struct SaveWorker {
    sink: Box<dyn BlockSink>,
    input: Receiver<ProcessedBlock>,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    stats: SaveStats,
}

impl SaveWorker {
    pub fn new(
        sink: Box<dyn BlockSink>,
        input: Receiver<ProcessedBlock>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Self {
        Self {
            sink,
            input,
            running,
            reporter,
            stats: SaveStats::default(),
        }
    }

    fn write(&mut self, block: &ProcessedBlock) {
        match self.sink.write(block) {
            Ok(()) => self.stats.written += 1,
            Err(e) => {
                self.stats.failed += 1;
                self.reporter
                    .error(format!("Failed to save block {}: {}", block.sequence, e));
            }
        }
    }

    /// Run until stopped or the queue closes, then drain what is left
    pub fn run(mut self) -> SaveStats {
        while self.running.load(Ordering::SeqCst) {
            match self.input.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(block) => self.write(&block),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(block) = self.input.try_recv() {
            self.write(&block);
        }
        if let Err(e) = self.sink.flush() {
            self.reporter.error(format!("Failed to flush save sink: {}", e));
        }

        self.reporter.debug(format!(
            "Saving stopped: {} blocks written, {} failed",
            self.stats.written, self.stats.failed
        ));
        self.stats
    }
}

/// Counters collected by the display worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayStats {
    pub blocks: u64,
    /// Display messages produced (one per source per block)
    pub updates: u64,
    /// Display messages dropped because the frontend queue was full
    pub dropped: u64,
}

/// Per-source display state
struct DisplayChannel {
    source: DataSource,
    /// One filter state per component, created on first use
    filter_states: Vec<FilterState>,
}

/// Worker turning processed blocks into display series
///
/// Display decimation keeps every `disp_ds`-th window counted across blocks,
/// so block boundaries do not shift the output grid. The optional lowpass runs
/// after decimation, at the display rate.
pub struct DisplayWorker {
    channels: Vec<DisplayChannel>,
    input: Receiver<ProcessedBlock>,
    disp_ds: usize,
    filter: Option<SosFilter>,
    /// Windows seen so far, for decimation across block boundaries
    position: u64,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    stats: DisplayStats,
}

impl DisplayWorker {
    /// Display the sources named in `labels`, or every source when empty
    pub fn new(
        topology: &ChannelTopology,
        labels: &[String],
        disp_ds: usize,
        input: Receiver<ProcessedBlock>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Self {
        let channels = topology
            .iter()
            .filter(|s| labels.is_empty() || labels.iter().any(|l| *l == s.label))
            .map(|source| DisplayChannel {
                source: source.clone(),
                filter_states: Vec::new(),
            })
            .collect();

        Self {
            channels,
            input,
            disp_ds: disp_ds.max(1),
            filter: None,
            position: 0,
            running,
            reporter,
            stats: DisplayStats::default(),
        }
    }

    /// Smooth every displayed series with a filter designed at the display rate
    pub fn with_filter(mut self, filter: SosFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sources sent to the display, in channel order
    pub fn sources(&self) -> Vec<&DataSource> {
        self.channels.iter().map(|c| &c.source).collect()
    }

    pub fn stats(&self) -> &DisplayStats {
        &self.stats
    }

    /// Decimate and filter one block; returns one series set per displayed source
    pub fn process(&mut self, block: &ProcessedBlock) -> Vec<(DataSource, Vec<Vec<f64>>)> {
        let ds = self.disp_ds as u64;
        let keep: Vec<usize> = (0..block.num_windows())
            .filter(|&w| (self.position + w as u64) % ds == 0)
            .collect();
        self.position += block.num_windows() as u64;
        self.stats.blocks += 1;

        if keep.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(self.channels.len());
        for channel in &mut self.channels {
            let row = channel.source.channel;
            if row >= block.num_sources() {
                continue;
            }

            let mut data: Vec<Vec<f64>> = (0..block.num_components())
                .map(|c| keep.iter().map(|&w| block.get(row, w, c)).collect())
                .collect();

            if let Some(filter) = &self.filter {
                if channel.filter_states.len() != data.len() {
                    channel.filter_states = (0..data.len()).map(|_| filter.new_state()).collect();
                }
                for (series, state) in data.iter_mut().zip(&mut channel.filter_states) {
                    *series = filter.process_real(series, state);
                    // A NaN row poisons the filter; start again from rest
                    if series.iter().any(|v| !v.is_finite()) {
                        state.reset();
                    }
                }
            }

            out.push((channel.source.clone(), data));
        }
        out
    }

    /// Run until stopped or the queue closes
    pub fn run(mut self) -> DisplayStats {
        while self.running.load(Ordering::SeqCst) {
            match self.input.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(block) => {
                    for (source, data) in self.process(&block) {
                        self.stats.updates += 1;
                        if !self.reporter.display(source, data) {
                            self.stats.dropped += 1;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.reporter.debug(format!(
            "Display stopped after {} blocks",
            self.stats.blocks
        ));
        self.stats
    }
}
