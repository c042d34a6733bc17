//! Spatial remapping for event-camera style `(x, y[, polarity])` streams.
//!
//! Coordinates outside the sensor are clipped to the nearest edge, never
//! dropped.

use super::{Arrival, Emission, OpError};
use crate::event::{Meta, MetaValue};
use crate::params::{ParamReader, ParamResult};

const MAX_SIDE: i64 = 1 << 16;

#[inline]
fn clip(v: i64, side: u32) -> i64 {
    v.clamp(0, side as i64 - 1)
}

fn meta_coord(meta: &Meta, key: &str) -> Option<i64> {
    meta.get(key).and_then(MetaValue::as_i64)
}

/// Extent of the sensor plane, read from `width` / `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        Ok(Self {
            width: r.int_in("width", 128, 1, MAX_SIDE)? as u32,
            height: r.int_in("height", 128, 1, MAX_SIDE)? as u32,
        })
    }

    fn dims_meta(&self) -> [(&'static str, MetaValue); 2] {
        [
            ("w", MetaValue::Int(self.width as i64)),
            ("h", MetaValue::Int(self.height as i64)),
        ]
    }
}

/// Flatten `(x, y[, p])` into one channel: `y * w + x`, or
/// `(y * w + x) * 2 + p` with polarity enabled.
#[derive(Debug, Clone)]
pub struct XyToChannel {
    pub extent: Extent,
    pub polarity: bool,
}

impl XyToChannel {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let extent = Extent::from_params(r)?;
        let polarity = r.bool_or("polarity", false)?;
        Ok(Self { extent, polarity })
    }

    pub fn new(width: u32, height: u32, polarity: bool) -> Self {
        Self {
            extent: Extent { width, height },
            polarity,
        }
    }

    pub fn channel(&self, x: i64, y: i64, p: i64) -> i64 {
        let x = clip(x, self.extent.width);
        let y = clip(y, self.extent.height);
        let flat = y * self.extent.width as i64 + x;
        if self.polarity {
            flat * 2 + p.clamp(0, 1)
        } else {
            flat
        }
    }

    fn coords(a: &Arrival) -> Result<(i64, i64, i64), OpError> {
        let x = a.idx.first().copied().or_else(|| meta_coord(&a.meta, "x"));
        let y = a.idx.get(1).copied().or_else(|| meta_coord(&a.meta, "y"));
        let (Some(x), Some(y)) = (x, y) else {
            return Err(OpError::Malformed("event carries no (x, y) coordinates".into()));
        };
        let p = a
            .idx
            .get(2)
            .copied()
            .or_else(|| meta_coord(&a.meta, "p"))
            .unwrap_or_else(|| i64::from(a.value.as_slice().first().is_some_and(|v| *v > 0.0)));
        Ok((x, y, p))
    }

    pub(super) fn step(&mut self, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        for a in arrivals {
            let (x, y, p) = Self::coords(a)?;
            let mut e = Emission::new(a.ts, vec![self.channel(x, y, p)], a.value.clone());
            e.meta = a.meta.clone();
            for (k, v) in self.extent.dims_meta() {
                e = e.tag(k, v);
            }
            out.push(e);
        }
        Ok(())
    }
}

/// Translate coordinates by `(dx, dy)`.
#[derive(Debug, Clone)]
pub struct ShiftXy {
    pub dx: i64,
    pub dy: i64,
    pub extent: Extent,
}

impl ShiftXy {
    pub(super) fn from_params(r: &mut ParamReader<'_>) -> ParamResult<Self> {
        let dx = r.i64_or("dx", 0)?;
        let dy = r.i64_or("dy", 0)?;
        let extent = Extent::from_params(r)?;
        Ok(Self { dx, dy, extent })
    }

    pub fn new(dx: i64, dy: i64, width: u32, height: u32) -> Self {
        Self {
            dx,
            dy,
            extent: Extent { width, height },
        }
    }

    fn shift(&self, x: i64, y: i64) -> (i64, i64) {
        (
            clip(x.saturating_add(self.dx), self.extent.width),
            clip(y.saturating_add(self.dy), self.extent.height),
        )
    }

    pub(super) fn step(&mut self, arrivals: &[Arrival], out: &mut Vec<Emission>) -> Result<(), OpError> {
        let w = self.extent.width as i64;
        for a in arrivals {
            let idx = match a.idx.as_slice() {
                [] => return Err(OpError::Malformed("shift needs a channel or (x, y) index".into())),
                [ch] => {
                    if *ch < 0 {
                        return Err(OpError::ChannelOutOfRange {
                            channel: *ch,
                            size: (self.extent.width * self.extent.height) as usize,
                        });
                    }
                    let (x, y) = self.shift(ch % w, ch / w);
                    vec![y * w + x]
                }
                [x, y, rest @ ..] => {
                    let (x, y) = self.shift(*x, *y);
                    let mut idx = vec![x, y];
                    idx.extend_from_slice(rest);
                    idx
                }
            };
            let mut e = Emission::new(a.ts, idx, a.value.clone());
            e.meta = a.meta.clone();
            out.push(e);
        }
        Ok(())
    }
}
