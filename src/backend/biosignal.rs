//! Biosignal worker
//!
//! Polls a biosignal amplifier for its most recent sample and fans the frames
//! out in batches: every channel's series goes to the display as its own
//! `Ch{n}` source and, when saving, every frame becomes one CSV row. The
//! worker runs beside the radio pipeline and shares nothing with it except the
//! [`Reporter`].

use super::Reporter;
use crate::config::BiosignalConfig;
use crate::hardware::biosignal::BiosignalDevice;
use crate::persistence::BiosignalCsvSink;
use crate::types::DataSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pause after a poll that found no new sample
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Counters collected by a biosignal worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BiosignalStats {
    pub samples: u64,
    pub batches: u64,
    pub rows_saved: u64,
    pub save_errors: u64,
    /// Display messages dropped because the frontend queue was full
    pub display_dropped: u64,
    pub read_errors: u64,
}

/// Data sources of a biosignal device: `Ch{n}` per enabled channel
///
/// `n` is the 1-based hardware channel; `channel` is the position among the
/// enabled channels.
pub fn biosignal_sources(config: &BiosignalConfig) -> Vec<DataSource> {
    let device: Arc<str> = Arc::from(config.name.as_str());
    config
        .enabled_channels()
        .into_iter()
        .enumerate()
        .map(|(channel, hw)| DataSource {
            device: Arc::clone(&device),
            channel,
            tx_index: hw,
            rx_index: hw,
            tx_device: 0,
            rx_device: 0,
            label: format!("Ch{}", hw + 1),
        })
        .collect()
}

/// Worker that owns one biosignal device while streaming
pub struct BiosignalWorker {
    name: String,
    device: Box<dyn BiosignalDevice>,
    sources: Vec<DataSource>,
    sink: Option<BiosignalCsvSink>,
    batch: usize,
    /// Frames gathered since the last flush
    pending: Vec<Vec<f64>>,
    running: Arc<AtomicBool>,
    reporter: Reporter,
    stats: BiosignalStats,
}

impl BiosignalWorker {
    pub fn new(
        config: &BiosignalConfig,
        device: Box<dyn BiosignalDevice>,
        running: Arc<AtomicBool>,
        reporter: Reporter,
    ) -> Self {
        Self {
            name: config.name.clone(),
            device,
            sources: biosignal_sources(config),
            sink: None,
            batch: config.batch.max(1),
            pending: Vec::with_capacity(config.batch),
            running,
            reporter,
            stats: BiosignalStats::default(),
        }
    }

    /// Also write every frame to `sink`
    pub fn with_sink(mut self, sink: BiosignalCsvSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn stats(&self) -> &BiosignalStats {
        &self.stats
    }

    /// Poll the device once; `Ok(false)` when no new sample was ready
    pub fn poll(&mut self) -> crate::error::Result<bool> {
        let mut frame = vec![0.0; self.sources.len() + 1];
        if !self.device.most_recent_sample(&mut frame)? {
            return Ok(false);
        }
        self.stats.samples += 1;
        self.pending.push(frame);
        if self.pending.len() >= self.batch {
            self.flush_batch();
        }
        Ok(true)
    }

    /// Save and display the pending frames
    pub fn flush_batch(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.stats.batches += 1;

        if let Some(sink) = self.sink.as_mut() {
            for frame in &self.pending {
                match sink.write_frame(frame) {
                    Ok(()) => self.stats.rows_saved += 1,
                    Err(e) => {
                        self.stats.save_errors += 1;
                        if self.stats.save_errors == 1 {
                            self.reporter.error(format!("[{}] Saving error: {}", self.name, e));
                        }
                    }
                }
            }
        }

        for (index, source) in self.sources.iter().enumerate() {
            let series: Vec<f64> = self.pending.iter().map(|frame| frame[index + 1]).collect();
            if !self.reporter.display(source.clone(), vec![series]) {
                self.stats.display_dropped += 1;
            }
        }
        self.pending.clear();
    }

    /// Acquire until stopped or the device fails, then hand the device back
    pub fn run(mut self) -> (Box<dyn BiosignalDevice>, BiosignalStats) {
        if let Err(e) = self.device.start_acquisition() {
            self.reporter
                .error(format!("[{}] Unable to start acquisition: {}", self.name, e));
            return (self.device, self.stats);
        }
        self.reporter.debug(format!(
            "[{}] Acquiring {} channels",
            self.name,
            self.sources.len()
        ));

        while self.running.load(Ordering::SeqCst) {
            match self.poll() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(IDLE_POLL),
                Err(e) => {
                    self.stats.read_errors += 1;
                    self.reporter.error(format!("[{}] Acquisition error: {}", self.name, e));
                    break;
                }
            }
        }

        self.flush_batch();
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.flush() {
                self.reporter.error(format!("[{}] Failed to flush save file: {}", self.name, e));
            }
        }
        if let Err(e) = self.device.stop_acquisition() {
            self.reporter
                .warn(format!("[{}] Failed to stop acquisition: {}", self.name, e));
        }
        self.reporter.debug(format!(
            "[{}] Acquisition stopped after {} samples",
            self.name, self.stats.samples
        ));
        (self.device, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendMessage;
    use crate::hardware::biosignal::{BiosignalDriver, SimBiosignalDriver, SimBiosignalSpec};
    use crossbeam_channel::bounded;
    use tempfile::tempdir;

    fn config() -> BiosignalConfig {
        let mut config = BiosignalConfig::new("biopac", vec![true, false, true]);
        config.batch = 4;
        config
    }

    #[test]
    fn test_sources_are_labelled_by_hardware_channel() {
        let sources = biosignal_sources(&config());
        let labels: Vec<&str> = sources.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Ch1", "Ch3"]);
        assert_eq!(sources[1].channel, 1);
        assert_eq!(&*sources[1].device, "biopac");
    }

    #[test]
    fn test_batches_reach_display_and_sink() {
        let config = config();
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default());
        let mut device = driver.connect(&config).unwrap();
        device.start_acquisition().unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("bio.csv");
        let sink = BiosignalCsvSink::create(&path, &biosignal_sources(&config), config.sample_rate).unwrap();
        let (tx, rx) = bounded(64);
        let mut worker = BiosignalWorker::new(
            &config,
            device,
            Arc::new(AtomicBool::new(true)),
            Reporter::new(tx.clone(), tx),
        )
        .with_sink(sink);

        for _ in 0..10 {
            assert!(worker.poll().unwrap());
        }
        // Two full batches flushed, two frames pending
        assert_eq!(worker.stats().batches, 2);
        assert_eq!(worker.stats().rows_saved, 8);
        worker.flush_batch();
        assert_eq!(worker.stats().rows_saved, 10);

        let series: Vec<(String, Vec<Vec<f64>>)> = rx
            .try_iter()
            .filter_map(|m| match m {
                BackendMessage::Display { source, data } => Some((source.label, data)),
                _ => None,
            })
            .collect();
        assert_eq!(series.len(), 6);
        assert_eq!(series[0].0, "Ch1");
        assert_eq!(series[1].0, "Ch3");
        assert_eq!(series[0].1[0].len(), 4);
        assert_eq!(series[4].1[0].len(), 2);
    }

    #[test]
    fn test_run_stops_on_read_failure() {
        let config = config();
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default().with_fail_after(6));
        let device = driver.connect(&config).unwrap();
        let worker = BiosignalWorker::new(&config, device, Arc::new(AtomicBool::new(true)), Reporter::detached());

        let (_device, stats) = worker.run();
        assert_eq!(stats.samples, 6);
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.batches, 2);
        let log = driver.log();
        assert_eq!((log.starts, log.stops), (1, 1));
        assert!(!log.acquiring);
    }

    #[test]
    fn test_run_until_stopped() {
        let config = config();
        let driver = SimBiosignalDriver::new(SimBiosignalSpec::default().with_realtime(true));
        let device = driver.connect(&config).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let worker = BiosignalWorker::new(&config, device, running.clone(), Reporter::detached());
        let handle = std::thread::spawn(move || worker.run());

        std::thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        let (device, stats) = handle.join().unwrap();

        assert_eq!(device.num_channels(), 2);
        assert!(stats.samples > 0);
        assert_eq!(stats.read_errors, 0);
        assert!(!driver.log().acquiring);
    }
}
