//! Mel filterbank over STFT magnitude frames.

use super::{Arrival, Emission, OpError};
use crate::event::{MetaValue, Value};
use crate::params::{ParamError, ParamReader, ParamResult};

#[inline]
pub fn hz_to_mel(f: f64) -> f64 {
    2595.0 * (1.0 + f / 700.0).log10()
}

#[inline]
pub fn mel_to_hz(m: f64) -> f64 {
    700.0 * (10f64.powf(m / 2595.0) - 1.0)
}

/// Triangular HTK-scale filters, one row per band over `n_fft / 2 + 1` bins.
///
/// The arithmetic is fixed (mel points linearly spaced on the HTK scale, bin
/// edges `floor((n_fft + 1) * f / sr)`, rows clamped at zero) so that every
/// implementation produces the same coefficients bit for bit.
pub fn build_mel_filters(n_fft: usize, n_mels: usize, sample_rate: u32, fmin_hz: f64, fmax_hz: f64) -> Vec<Vec<f64>> {
    let n_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let mel_min = hz_to_mel(fmin_hz);
    let mel_max = hz_to_mel(fmax_hz);
    let bin_points: Vec<i64> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .map(mel_to_hz)
        .map(|f| ((n_fft + 1) as f64 * f / sr).floor() as i64)
        .collect();

    let mut filters = vec![vec![0.0; n_bins]; n_mels];
    for m in 1..=n_mels {
        let (lo, mid, hi) = (bin_points[m - 1], bin_points[m], bin_points[m + 1]);
        let first = lo.max(0);
        let last = hi.min(n_bins as i64 - 1);
        for k in first..=last {
            let w = if k < mid {
                let denom = if mid == lo { 1 } else { mid - lo };
                (k - lo) as f64 / denom as f64
            } else {
                let denom = if hi == mid { 1 } else { hi - mid };
                (hi - k) as f64 / denom as f64
            };
            filters[m - 1][k as usize] = w.max(0.0);
        }
    }
    filters
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MelOutput {
    /// One scalar event per band, `idx = [band]`.
    Bands,
    /// One vector event per frame.
    Vector,
}

#[derive(Debug, Clone)]
pub struct MelBands {
    pub n_fft: usize,
    pub log: bool,
    pub output: MelOutput,
    filters: Vec<Vec<f64>>,
}

impl MelBands {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let sample_rate = r.int_in("sample_rate", 16_000, 1, 1_000_000_000)? as u32;
        let n_fft = r.int_in("n_fft", 256, 2, 1 << 20)? as usize;
        let n_mels = r.int_in("n_mels", 32, 1, 4096)? as usize;
        let nyquist = sample_rate as f64 / 2.0;
        let fmin = r.f64_or("fmin_hz", 0.0)?;
        let fmax = r.f64_or("fmax_hz", nyquist)?;
        if fmin < 0.0 || fmin >= fmax {
            return Err(ParamError::invalid("fmin_hz", "must satisfy 0 <= fmin_hz < fmax_hz"));
        }
        if fmax > nyquist {
            return Err(ParamError::invalid("fmax_hz", format!("exceeds Nyquist ({nyquist} Hz)")));
        }
        let log = r.bool_or("log", true)?;
        let output = match r.str_or("output", "bands")? {
            "bands" => MelOutput::Bands,
            "vector" => MelOutput::Vector,
            other => {
                return Err(ParamError::invalid(
                    "output",
                    format!("'{other}' is not one of bands, vector"),
                ))
            }
        };
        Ok(Self::new(
            build_mel_filters(n_fft, n_mels, sample_rate, fmin, fmax),
            n_fft,
            log,
            output,
        ))
    }

    pub fn new(filters: Vec<Vec<f64>>, n_fft: usize, log: bool, output: MelOutput) -> Self {
        Self {
            n_fft,
            log,
            output,
            filters,
        }
    }

    pub fn filters(&self) -> &[Vec<f64>] {
        &self.filters
    }

    fn energies(&self, spectrum: &[f64]) -> Vec<f64> {
        self.filters
            .iter()
            .map(|row| {
                let e: f64 = row.iter().zip(spectrum).map(|(w, s)| w * s).sum();
                if self.log {
                    e.max(1e-12).ln()
                } else {
                    e
                }
            })
            .collect()
    }

    pub(super) fn step(&mut self, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        let n_bins = self.n_fft / 2 + 1;
        for a in arrivals {
            let Value::Vector(spectrum) = &a.value else {
                return Err(OpError::Malformed("expected a spectrum frame (vector value)".into()));
            };
            if spectrum.len() != n_bins {
                return Err(OpError::Malformed(format!(
                    "spectrum has {} bins, filterbank expects {n_bins}",
                    spectrum.len()
                )));
            }
            let energies = self.energies(spectrum);
            match self.output {
                MelOutput::Vector => {
                    out.push(Emission::new(a.ts, vec![0], energies).tag("unit", "mel"));
                }
                MelOutput::Bands => {
                    for (m, e) in energies.into_iter().enumerate() {
                        out.push(
                            Emission::new(a.ts, vec![m as i64], e)
                                .tag("unit", "mel")
                                .tag("band", MetaValue::Int(m as i64)),
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
