//! CSV persistence of processed blocks
//!
//! One row per output window, one column pair per data source:
//!
//! ```text
//! # bioview-rs multi_usrp 2026-01-01T12:00:00+00:00 mode=magnitude_phase
//! sequence,window,Tx1Rx1_mag,Tx1Rx1_phase,...
//! 0,0,0.49,12.5,...
//! ```
//!
//! Biosignal frames go to their own file, one row per sample:
//!
//! ```text
//! # bioview-rs biopac 2026-01-01T12:00:00+00:00 rate=1000
//! timestamp_ms,Ch1,Ch3
//! 0,0,0
//! ```

use crate::backend::BlockSink;
use crate::error::{BioviewError, Result};
use crate::topology::ChannelTopology;
use crate::types::{DataSource, OutputMode, ProcessedBlock};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Block sink writing CSV rows to a file
#[derive(Debug)]
pub struct CsvBlockSink {
    path: PathBuf,
    writer: BufWriter<File>,
    num_sources: usize,
    rows_written: u64,
}

/// Create parent directories and open `path` for buffered writing
fn open_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .map_err(|e| BioviewError::Io(e).with_context(format!("Failed to create {:?}", path)))?;
    Ok(BufWriter::new(file))
}

fn column_suffixes(mode: OutputMode) -> [&'static str; 2] {
    match mode {
        OutputMode::Iq => ["i", "q"],
        OutputMode::MagnitudePhase => ["mag", "phase"],
    }
}

impl CsvBlockSink {
    /// Create (or truncate) the file and write the header
    pub fn create(path: impl AsRef<Path>, topology: &ChannelTopology, mode: OutputMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = open_writer(&path)?;

        let mode_name = match mode {
            OutputMode::Iq => "iq",
            OutputMode::MagnitudePhase => "magnitude_phase",
        };
        let owner = topology.iter().next().map(|s| s.device.to_string()).unwrap_or_default();
        writeln!(
            writer,
            "# bioview-rs {} {} mode={}",
            owner,
            chrono::Utc::now().to_rfc3339(),
            mode_name
        )?;

        let [first, second] = column_suffixes(mode);
        let mut header = String::from("sequence,window");
        for source in topology.iter() {
            header.push_str(&format!(",{}_{},{}_{}", source.label, first, source.label, second));
        }
        writeln!(writer, "{}", header)?;

        tracing::info!("Saving {} sources to {:?}", topology.len(), path);
        Ok(Self {
            path,
            writer,
            num_sources: topology.len(),
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl BlockSink for CsvBlockSink {
    fn write(&mut self, block: &ProcessedBlock) -> Result<()> {
        if block.num_sources() != self.num_sources || block.num_components() != 2 {
            return Err(BioviewError::Processing(format!(
                "Block {} has {} sources and {} components, file expects {} and 2",
                block.sequence,
                block.num_sources(),
                block.num_components(),
                self.num_sources
            )));
        }

        let mut row = String::new();
        for window in 0..block.num_windows() {
            row.clear();
            row.push_str(&format!("{},{}", block.sequence, window));
            for source in 0..block.num_sources() {
                row.push_str(&format!(
                    ",{},{}",
                    block.get(source, window, 0),
                    block.get(source, window, 1)
                ));
            }
            writeln!(self.writer, "{}", row)?;
            self.rows_written += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Biosignal frame writer
pub struct BiosignalCsvSink {
    writer: BufWriter<File>,
    num_channels: usize,
    rows_written: u64,
}

impl BiosignalCsvSink {
    /// Create (or truncate) the file and write the header
    pub fn create(path: impl AsRef<Path>, sources: &[DataSource], sample_rate: f64) -> Result<Self> {
        let path = path.as_ref();
        let mut writer = open_writer(path)?;
        let owner = sources.first().map(|s| s.device.to_string()).unwrap_or_default();
        writeln!(
            writer,
            "# bioview-rs {} {} rate={}",
            owner,
            chrono::Utc::now().to_rfc3339(),
            sample_rate
        )?;
        let mut header = String::from("timestamp_ms");
        for source in sources {
            header.push(',');
            header.push_str(&source.label);
        }
        writeln!(writer, "{}", header)?;

        tracing::info!("Saving {} biosignal channels to {:?}", sources.len(), path);
        Ok(Self {
            writer,
            num_channels: sources.len(),
            rows_written: 0,
        })
    }

    /// Write one frame: timestamp then one value per channel
    pub fn write_frame(&mut self, frame: &[f64]) -> Result<()> {
        if frame.len() != self.num_channels + 1 {
            return Err(BioviewError::Processing(format!(
                "Frame has {} values, file expects {}",
                frame.len(),
                self.num_channels + 1
            )));
        }
        let row: Vec<String> = frame.iter().map(f64::to_string).collect();
        writeln!(self.writer, "{}", row.join(","))?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}
