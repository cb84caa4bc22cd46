//! Continuous-tone transmit waveforms
//!
//! A waveform is re-sent back to back, so its length must hold a whole number
//! of cycles of every tone on the stream. For an integer frequency `f` at an
//! integer rate `fs` the shortest such length is `fs / gcd(fs, f)`.

use crate::error::{BioviewError, Result};
use num_complex::Complex32;
use std::f64::consts::PI;

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

fn integral(value: f64, what: &str) -> Result<u64> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(BioviewError::Config(format!(
            "{} must be a whole number of Hz, got {}",
            what, value
        )));
    }
    Ok(value.abs() as u64)
}

/// Shortest number of samples holding whole cycles of `freq`
pub fn cycle_length(sample_rate: f64, freq: f64) -> Result<u64> {
    let fs = integral(sample_rate, "Sample rate")?;
    if fs == 0 {
        return Err(BioviewError::Config("Sample rate must be positive".into()));
    }
    let f = integral(freq, "Tone frequency")?;
    Ok(fs / gcd(fs, f))
}

/// Length of the shared transmit waveform for a set of tones
///
/// The base length is the least common multiple of every tone's cycle length;
/// the result is the smallest multiple of the base not shorter than
/// `max_samps_per_packet`. A base longer than two seconds of samples is
/// rejected.
pub fn waveform_length(sample_rate: f64, freqs: &[f64], max_samps_per_packet: usize) -> Result<usize> {
    let mut base = 1u64;
    for &freq in freqs {
        base = lcm(base, cycle_length(sample_rate, freq)?);
        if base as f64 > 2.0 * sample_rate {
            return Err(BioviewError::Config(format!(
                "Tone set {:?} needs a {} sample waveform at {} Hz (over two seconds)",
                freqs, base, sample_rate
            )));
        }
    }
    let target = max_samps_per_packet.max(1) as u64;
    let multiples = target.div_ceil(base);
    Ok((base * multiples) as usize)
}

/// `amplitude * exp(j 2π f n / fs)` for `n` in `0..len`
pub fn generate_tone(freq: f64, amplitude: f32, sample_rate: f64, len: usize) -> Vec<Complex32> {
    (0..len)
        .map(|n| {
            let phase = (2.0 * PI * freq * n as f64 / sample_rate) % (2.0 * PI);
            Complex32::from_polar(amplitude, phase as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcd_lcm() {
        assert_eq!(gcd(1_000_000, 100_000), 100_000);
        assert_eq!(gcd(7, 13), 1);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(0, 6), 0);
    }

    #[test]
    fn test_cycle_length() {
        assert_eq!(cycle_length(1e6, 100e3).unwrap(), 10);
        assert_eq!(cycle_length(1e6, 0.0).unwrap(), 1);
        assert_eq!(cycle_length(1e6, 3.0).unwrap(), 1_000_000);
        assert!(cycle_length(1e6, 100.5).is_err());
    }

    #[test]
    fn test_waveform_length() {
        // 100 kHz and 125 kHz at 1 MHz: cycles of 10 and 8, base 40
        let len = waveform_length(1e6, &[100e3, 125e3], 2000).unwrap();
        assert_eq!(len, 2000);

        let len = waveform_length(1e6, &[100e3, 125e3], 2010).unwrap();
        assert_eq!(len, 2040);
        assert_eq!(len % 40, 0);
    }

    #[test]
    fn test_waveform_length_rejects_fractional_tones() {
        assert!(waveform_length(1e6, &[100e3, 10.25], 100).is_err());
        assert!(waveform_length(1e6 + 0.5, &[100e3], 100).is_err());
        assert_eq!(waveform_length(1e6, &[1.0, 3.0, 7.0], 100).unwrap(), 1_000_000);
    }

    #[test]
    fn test_generated_tone_wraps_seamlessly() {
        let fs = 1e6;
        let len = waveform_length(fs, &[100e3], 1000).unwrap();
        let wave = generate_tone(100e3, 0.5, fs, len);
        assert_eq!(wave.len(), len);
        assert!((wave[0].norm() - 0.5).abs() < 1e-6);

        // Sample after the last one would equal the first
        let step = Complex32::from_polar(1.0, (2.0 * PI * 100e3 / fs) as f32);
        let next = wave[len - 1] * step;
        assert!((next - wave[0]).norm() < 1e-4);
    }
}
