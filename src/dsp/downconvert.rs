//! Phase-continuous downconversion and window reduction

use crate::types::OutputMode;
use num_complex::Complex64;
use std::f64::consts::PI;

const TWO_PI: f64 = 2.0 * PI;

/// Running oscillator phase for one source
///
/// Phase is carried across buffers so that mixing consecutive buffers gives
/// the same result as mixing their concatenation. The stored value is wrapped
/// to `[0, 2π)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseAccumulator {
    phase: f64,
}

impl PhaseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Multiply `samples` in place by `exp(-j(phase + n * 2π f / fs))`
    /// and advance the accumulator past the last sample.
    pub fn mix_down(&mut self, samples: &mut [Complex64], if_freq: f64, sample_rate: f64) {
        let increment = TWO_PI * if_freq / sample_rate;
        for (n, s) in samples.iter_mut().enumerate() {
            let phase = self.phase + n as f64 * increment;
            *s *= Complex64::from_polar(1.0, -phase);
        }
        self.phase = (self.phase + samples.len() as f64 * increment).rem_euclid(TWO_PI);
    }
}

/// Reduce non-overlapping windows of `window` samples to two components each
///
/// A trailing partial window is dropped. Returns `(first, second)` per window:
/// mean real and imaginary parts in [`OutputMode::Iq`], mean magnitude and
/// circular mean phase in degrees in [`OutputMode::MagnitudePhase`].
pub fn reduce_windows(samples: &[Complex64], window: usize, mode: OutputMode) -> Vec<(f64, f64)> {
    if window == 0 {
        return Vec::new();
    }
    samples
        .chunks_exact(window)
        .map(|chunk| {
            let len = chunk.len() as f64;
            match mode {
                OutputMode::Iq => {
                    let sum: Complex64 = chunk.iter().sum();
                    (sum.re / len, sum.im / len)
                }
                OutputMode::MagnitudePhase => {
                    let mut mag = 0.0;
                    let mut unit = Complex64::new(0.0, 0.0);
                    for s in chunk {
                        let norm = s.norm();
                        mag += norm;
                        if norm > 0.0 {
                            unit += s / norm;
                        }
                    }
                    (mag / len, unit.arg().to_degrees())
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, fs: f64, start: usize, len: usize) -> Vec<Complex64> {
        (start..start + len)
            .map(|n| Complex64::from_polar(1.0, TWO_PI * freq * n as f64 / fs))
            .collect()
    }

    #[test]
    fn test_mix_down_tone_to_dc() {
        let fs = 48_000.0;
        let mut acc = PhaseAccumulator::new();
        let mut samples = tone(1_000.0, fs, 0, 480);
        acc.mix_down(&mut samples, 1_000.0, fs);

        for s in &samples {
            assert!((s - Complex64::new(1.0, 0.0)).norm() < 1e-9);
        }
    }

    #[test]
    fn test_phase_continuity_across_buffers() {
        let fs = 100_000.0;
        let freq = 10_000.0;
        let mut acc = PhaseAccumulator::new();

        // Odd buffer length so the phase does not realign by accident
        for buffer in 0..5 {
            let mut samples = tone(freq, fs, buffer * 333, 333);
            acc.mix_down(&mut samples, freq, fs);
            for s in &samples {
                assert!(s.arg().abs() < 1e-6);
            }
        }
        assert!(acc.phase() >= 0.0 && acc.phase() < TWO_PI);
    }

    #[test]
    fn test_reduce_windows_drops_partial() {
        let samples = vec![Complex64::new(1.0, 2.0); 250];
        let out = reduce_windows(&samples, 100, OutputMode::Iq);
        assert_eq!(out.len(), 2);
        assert!((out[0].0 - 1.0).abs() < 1e-12);
        assert!((out[0].1 - 2.0).abs() < 1e-12);

        let short = reduce_windows(&samples[..99], 100, OutputMode::Iq);
        assert!(short.is_empty());
    }

    #[test]
    fn test_reduce_windows_circular_phase() {
        // +179 and -179 degrees average to 180, not 0
        let samples = vec![
            Complex64::from_polar(2.0, 179f64.to_radians()),
            Complex64::from_polar(2.0, -179f64.to_radians()),
        ];
        let out = reduce_windows(&samples, 2, OutputMode::MagnitudePhase);
        assert_eq!(out.len(), 1);
        assert!((out[0].0 - 2.0).abs() < 1e-12);
        assert!((out[0].1.abs() - 180.0).abs() < 1e-9);
    }
}
