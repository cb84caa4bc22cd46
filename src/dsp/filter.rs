//! Butterworth IIR filters as cascaded second-order sections
//!
//! Filters are designed from the analog Butterworth prototype, transformed to
//! the requested band and mapped to the z-plane with the bilinear transform
//! (band edges prewarped). Each section runs in transposed direct form II with
//! its own pair of delay elements held in a [`FilterState`], so a filter can be
//! applied to consecutive buffers as if they were one long signal.

use crate::error::{BioviewError, Result};
use num_complex::{Complex32, Complex64};
use std::f64::consts::PI;

/// Imaginary parts below this are treated as real poles
const REAL_POLE_EPS: f64 = 1e-9;

/// One second-order section, `a0` normalised to 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 2],
}

impl Biquad {
    fn response(&self, z_inv: Complex64) -> Complex64 {
        let z_inv2 = z_inv * z_inv;
        let num = self.b[0] + z_inv * self.b[1] + z_inv2 * self.b[2];
        let den = Complex64::new(1.0, 0.0) + z_inv * self.a[0] + z_inv2 * self.a[1];
        num / den
    }
}

/// Delay elements of every section of one filter instance
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    delays: Vec<[Complex64; 2]>,
}

impl FilterState {
    /// Clear all delay elements
    pub fn reset(&mut self) {
        for d in &mut self.delays {
            *d = [Complex64::new(0.0, 0.0); 2];
        }
    }
}

/// Cascade of second-order sections
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

/// Analog Butterworth prototype poles (cutoff 1 rad/s)
fn prototype_poles(order: usize) -> Vec<Complex64> {
    let n = order as f64;
    (0..order)
        .map(|k| {
            let theta = PI * (2.0 * k as f64 + n + 1.0) / (2.0 * n);
            Complex64::from_polar(1.0, theta)
        })
        .collect()
}

/// Bilinear transform of one s-plane root
fn bilinear(s: Complex64, fs: f64) -> Complex64 {
    let k = 2.0 * fs;
    (k + s) / (k - s)
}

/// Prewarped analog angular frequency for a digital frequency
fn prewarp(freq: f64, fs: f64) -> f64 {
    2.0 * fs * (PI * freq / fs).tan()
}

/// Group z-plane poles into denominators: conjugate pairs first, then real
/// poles two at a time. A single leftover real pole yields a first-order term.
fn pole_denominators(poles: &[Complex64]) -> Vec<[f64; 2]> {
    let mut dens = Vec::new();
    let mut reals = Vec::new();
    for p in poles {
        if p.im > REAL_POLE_EPS {
            dens.push([-2.0 * p.re, p.norm_sqr()]);
        } else if p.im.abs() <= REAL_POLE_EPS {
            reals.push(p.re);
        }
    }
    for pair in reals.chunks(2) {
        match *pair {
            [r1, r2] => dens.push([-(r1 + r2), r1 * r2]),
            [r] => dens.push([-r, 0.0]),
            _ => {}
        }
    }
    dens
}

impl SosFilter {
    /// Build a filter directly from sections
    pub fn from_sections(sections: Vec<Biquad>) -> Self {
        Self { sections }
    }

    /// Butterworth bandpass between `low` and `high` Hz
    ///
    /// `order` is the prototype order; the resulting filter has `order`
    /// sections (twice the order in poles).
    pub fn butterworth_bandpass(order: usize, low: f64, high: f64, fs: f64) -> Result<Self> {
        if order == 0 {
            return Err(BioviewError::Config("Filter order must be at least 1".into()));
        }
        if !(low > 0.0 && low < high && high < fs / 2.0) {
            return Err(BioviewError::Config(format!(
                "Invalid bandpass edges {}..{} Hz at sample rate {} Hz",
                low, high, fs
            )));
        }

        let w1 = prewarp(low, fs);
        let w2 = prewarp(high, fs);
        let bw = w2 - w1;
        let w0_sq = w1 * w2;

        // Each prototype pole p maps to the two roots of s^2 - p*bw*s + w0^2
        let mut poles = Vec::with_capacity(2 * order);
        for p in prototype_poles(order) {
            let pb = p * bw;
            let disc = (pb * pb - 4.0 * w0_sq).sqrt();
            poles.push(bilinear((pb + disc) / 2.0, fs));
            poles.push(bilinear((pb - disc) / 2.0, fs));
        }

        // Zeros: `order` at z = 1 and `order` at z = -1, one of each per section
        let sections = pole_denominators(&poles)
            .into_iter()
            .map(|a| Biquad { b: [1.0, 0.0, -1.0], a })
            .collect();
        let mut filter = Self { sections };

        let center = fs / PI * (w0_sq.sqrt() / (2.0 * fs)).atan();
        filter.normalize_at(center, fs);
        Ok(filter)
    }

    /// Butterworth bandpass of width `bandwidth` centred at `center` Hz
    pub fn bandpass_around(order: usize, center: f64, bandwidth: f64, fs: f64) -> Result<Self> {
        Self::butterworth_bandpass(order, center - bandwidth / 2.0, center + bandwidth / 2.0, fs)
    }

    /// Butterworth lowpass with cutoff `cutoff` Hz
    pub fn butterworth_lowpass(order: usize, cutoff: f64, fs: f64) -> Result<Self> {
        if order == 0 {
            return Err(BioviewError::Config("Filter order must be at least 1".into()));
        }
        if !(cutoff > 0.0 && cutoff < fs / 2.0) {
            return Err(BioviewError::Config(format!(
                "Invalid lowpass cutoff {} Hz at sample rate {} Hz",
                cutoff, fs
            )));
        }

        let wc = prewarp(cutoff, fs);
        let poles: Vec<Complex64> = prototype_poles(order)
            .into_iter()
            .map(|p| bilinear(p * wc, fs))
            .collect();

        // All zeros at z = -1
        let sections = pole_denominators(&poles)
            .into_iter()
            .map(|a| {
                let b = if a[1] == 0.0 { [1.0, 1.0, 0.0] } else { [1.0, 2.0, 1.0] };
                Biquad { b, a }
            })
            .collect();
        let mut filter = Self { sections };
        filter.normalize_at(0.0, fs);
        Ok(filter)
    }

    /// Scale the first section so that |H| = 1 at `freq`
    fn normalize_at(&mut self, freq: f64, fs: f64) {
        let gain = self.response(freq, fs).norm();
        if gain > 0.0 && gain.is_finite() {
            if let Some(first) = self.sections.first_mut() {
                for b in &mut first.b {
                    *b /= gain;
                }
            }
        }
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Complex frequency response at `freq` Hz
    pub fn response(&self, freq: f64, fs: f64) -> Complex64 {
        let z_inv = Complex64::from_polar(1.0, -2.0 * PI * freq / fs);
        self.sections
            .iter()
            .fold(Complex64::new(1.0, 0.0), |acc, s| acc * s.response(z_inv))
    }

    /// Zeroed state for a new, independent signal
    pub fn new_state(&self) -> FilterState {
        FilterState {
            delays: vec![[Complex64::new(0.0, 0.0); 2]; self.sections.len()],
        }
    }

    #[inline]
    fn step(&self, state: &mut FilterState, x: Complex64) -> Complex64 {
        let mut v = x;
        for (s, d) in self.sections.iter().zip(state.delays.iter_mut()) {
            let y = s.b[0] * v + d[0];
            d[0] = s.b[1] * v - s.a[0] * y + d[1];
            d[1] = s.b[2] * v - s.a[1] * y;
            v = y;
        }
        v
    }

    /// Filter complex samples into `out`, carrying `state` across calls
    pub fn process(&self, input: &[Complex32], state: &mut FilterState, out: &mut Vec<Complex64>) {
        out.clear();
        out.reserve(input.len());
        for &x in input {
            let x = Complex64::new(x.re as f64, x.im as f64);
            out.push(self.step(state, x));
        }
    }

    /// Filter a real signal, carrying `state` across calls
    pub fn process_real(&self, input: &[f64], state: &mut FilterState) -> Vec<f64> {
        input
            .iter()
            .map(|&x| self.step(state, Complex64::new(x, 0.0)).re)
            .collect()
    }
}
