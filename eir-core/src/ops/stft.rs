//! Streaming short-time Fourier transform over PCM sample events.
//!
//! Sample timestamps are mapped to the nearest sample index; samples that
//! never arrive count as zeros. Framing starts at the first sample received,
//! rounded down to a hop boundary, so a stream that begins late buffers only
//! real signal. A frame is emitted as soon as its last sample index has been
//! reached, timestamped at the frame end (or at the current instant when a
//! gap closed it late), carrying the `n_fft / 2 + 1` bin magnitudes. Partial
//! frames are never flushed.

use core::fmt;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use super::{Arrival, Emission, OpError};
use crate::event::MetaValue;
use crate::params::{ParamError, ParamReader, ParamResult};
use crate::units::{TimeUnit, NS_PER_MS, NS_PER_S};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Hann,
    Rect,
}

impl Window {
    pub fn coefficients(self, n: usize) -> Vec<f64> {
        match self {
            Window::Rect => vec![1.0; n],
            Window::Hann if n <= 1 => vec![1.0; n],
            Window::Hann => (0..n)
                .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
                .collect(),
        }
    }
}

/// ts (ns) -> nearest sample index.
#[inline]
pub fn sample_index(ts: u64, sample_rate: u32) -> u64 {
    ((ts as u128 * sample_rate as u128 + (NS_PER_S as u128 / 2)) / NS_PER_S as u128) as u64
}

/// sample index -> ts (ns), rounded to nearest.
#[inline]
pub fn sample_time(index: u64, sample_rate: u32) -> u64 {
    let sr = sample_rate as u128;
    ((index as u128 * NS_PER_S as u128 + sr / 2) / sr) as u64
}

#[derive(Clone)]
pub struct Stft {
    pub sample_rate: u32,
    pub win: usize,
    pub hop: usize,
    pub n_fft: usize,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
    /// Sample index of `buf[0]`, the start of the next frame. Unset until
    /// the first sample arrives.
    base: Option<u64>,
    buf: VecDeque<f64>,
    frames: u64,
}

impl fmt::Debug for Stft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stft")
            .field("sample_rate", &self.sample_rate)
            .field("win", &self.win)
            .field("hop", &self.hop)
            .field("n_fft", &self.n_fft)
            .field("base", &self.base)
            .field("buffered", &self.buf.len())
            .field("frames", &self.frames)
            .finish()
    }
}

impl Stft {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let sample_rate = r.int_in("sample_rate", 16_000, 1, 1_000_000_000)? as u32;
        let win_ns = r.duration_or("win_ms", TimeUnit::Ms, 16 * NS_PER_MS)?;
        let hop_ns = r.duration_or("hop_ms", TimeUnit::Ms, 10 * NS_PER_MS)?;
        let win = sample_index(win_ns, sample_rate) as usize;
        let hop = sample_index(hop_ns, sample_rate) as usize;
        if win < 2 {
            return Err(ParamError::invalid("win_ms", "window must span at least 2 samples"));
        }
        if hop == 0 {
            return Err(ParamError::invalid("hop_ms", "hop must span at least 1 sample"));
        }
        let n_fft = r.i64_or("n_fft", win as i64)?;
        if n_fft < win as i64 {
            return Err(ParamError::invalid(
                "n_fft",
                format!("{n_fft} is shorter than the window ({win} samples)"),
            ));
        }
        let window = match r.str_or("window", "hann")? {
            "hann" => Window::Hann,
            "rect" => Window::Rect,
            other => {
                return Err(ParamError::invalid(
                    "window",
                    format!("'{other}' is not one of hann, rect"),
                ))
            }
        };
        Ok(Self::new(sample_rate, win, hop, n_fft as usize, window))
    }

    pub fn new(sample_rate: u32, win: usize, hop: usize, n_fft: usize, window: Window) -> Self {
        let fft = FftPlanner::<f64>::new().plan_fft_forward(n_fft);
        Self {
            sample_rate,
            win,
            hop,
            n_fft,
            window: window.coefficients(win),
            fft,
            base: None,
            buf: VecDeque::new(),
            frames: 0,
        }
    }

    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    fn spectrum(&self) -> Vec<f64> {
        let mut frame: Vec<Complex64> = self
            .buf
            .iter()
            .take(self.win)
            .zip(&self.window)
            .map(|(&s, &w)| Complex64::new(s * w, 0.0))
            .collect();
        frame.resize(self.n_fft, Complex64::new(0.0, 0.0));
        self.fft.process(&mut frame);
        frame[..self.bins()].iter().map(|c| c.norm()).collect()
    }

    /// Close the frame starting at `base` and advance by one hop.
    fn close_frame(&mut self, base: u64, t: u64, out: &mut Vec<Emission>) -> u64 {
        let end = sample_time(base + self.win as u64, self.sample_rate);
        let mags = self.spectrum();
        out.push(
            Emission::new(end.max(t), vec![0], mags)
                .tag("unit", "mag")
                .tag("n_fft", MetaValue::Int(self.n_fft as i64))
                .tag("frame", MetaValue::Int(self.frames as i64)),
        );
        self.frames += 1;
        let drop = self.hop.min(self.buf.len());
        self.buf.drain(..drop);
        base + self.hop as u64
    }

    pub(super) fn step(&mut self, t: u64, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        let hop = self.hop as u64;
        let win = self.win as u64;
        for a in arrivals {
            let sample = a.scalar()?;
            let i = sample_index(a.ts, self.sample_rate);
            let mut base = self.base.unwrap_or(i - i % hop);
            if i < base {
                // Belongs to a frame that has already been emitted.
                continue;
            }
            // Frames a gap skipped past are complete; zeros fill the hole.
            while i >= base + win {
                base = self.close_frame(base, t, out);
            }
            let offset = (i - base) as usize;
            if offset >= self.buf.len() {
                self.buf.resize(offset + 1, 0.0);
            }
            self.buf[offset] = sample;
            if self.buf.len() >= self.win {
                base = self.close_frame(base, t, out);
            }
            self.base = Some(base);
        }
        Ok(())
    }
}
