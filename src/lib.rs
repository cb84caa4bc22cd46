//! # bioview-rs: Multi-device RF acquisition and IF demodulation
//!
//! Each software-defined radio transmits one continuous tone per transmit
//! channel at a distinct intermediate frequency and receives on every receive
//! channel. Every (transmit, receive) pair forms a data source whose amplitude
//! and phase are recovered by mixing the received samples down from the
//! tone's IF, lowpass filtering and averaging over fixed windows.
//!
//! ## Architecture
//!
//! - **Hardware**: radio driver traits plus a simulated driver ([`hardware::sim`])
//! - **Topology**: enumeration of data sources across devices ([`topology`])
//! - **DSP**: filter design, downconversion and tone synthesis ([`dsp`])
//! - **Backend**: acquisition, transmission and demodulation workers supervised
//!   by the [`backend::DeviceOrchestrator`], commanded through a
//!   [`backend::FrontendHandle`]
//! - **Communication**: crossbeam channels between every pipeline stage
//!
//! ## Configuration
//!
//! Experiments are described by an [`ExperimentConfig`] loaded from TOML or
//! JSON. The device address book lives in the platform data directory under
//! `org.bioview.bioview-rs`.
//!
//! ## Example
//!
//! ```ignore
//! use bioview_rs::{backend::AcquisitionBackend, hardware::sim::SimDriver, ExperimentConfig};
//!
//! let config = ExperimentConfig::load("experiment.toml")?;
//! let (backend, frontend) = AcquisitionBackend::new(config, Arc::new(SimDriver::new()));
//! std::thread::spawn(move || backend.run());
//!
//! frontend.connect();
//! // Wait for a Connected status, then:
//! frontend.start();
//! ```

pub mod backend;
pub mod config;
pub mod dsp;
pub mod error;
pub mod hardware;
pub mod persistence;
pub mod topology;
pub mod types;

// Re-export commonly used types
pub use backend::{AcquisitionBackend, BackendCommand, BackendMessage, FrontendHandle, ParamUpdate};
pub use config::{DeviceConfig, ExperimentConfig};
pub use error::{BioviewError, Result};
pub use topology::ChannelTopology;
pub use types::{ConnectionState, DataSource, OutputMode, ProcessedBlock, RawSampleBuffer};
