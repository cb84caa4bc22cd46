//! Signal processing primitives for IF demodulation
//!
//! - [`filter`] - Butterworth IIR design and stateful second-order-section filtering
//! - [`downconvert`] - Phase-continuous mixing to baseband and window reduction
//! - [`tone`] - Continuous-tone waveform sizing and generation for transmission

pub mod downconvert;
pub mod filter;
pub mod tone;

pub use downconvert::{reduce_windows, PhaseAccumulator};
pub use filter::{FilterState, SosFilter};
pub use tone::{generate_tone, waveform_length};
