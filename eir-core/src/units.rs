//! Time units: human duration strings to integer nanoseconds.
//!
//! All timestamps inside the engine are `u64` nanoseconds. Documents and
//! external streams may declare a coarser unit; conversion happens once at
//! the boundary.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NS_PER_US: u64 = 1_000;
pub const NS_PER_MS: u64 = 1_000_000;
pub const NS_PER_S: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitsError {
    #[error("invalid time literal '{0}': empty")]
    Empty(String),
    #[error("invalid time literal '{0}': unknown unit")]
    UnknownUnit(String),
    #[error("invalid time literal '{0}': not a number")]
    NotANumber(String),
    #[error("invalid time literal '{0}': negative duration")]
    Negative(String),
    #[error("invalid time literal '{0}': out of range")]
    Overflow(String),
}

/// Declared unit of an integer timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    #[inline]
    pub fn ns_per_unit(self) -> u64 {
        match self {
            TimeUnit::Ns => 1,
            TimeUnit::Us => NS_PER_US,
            TimeUnit::Ms => NS_PER_MS,
            TimeUnit::S => NS_PER_S,
        }
    }

    /// Integer count in this unit to nanoseconds (saturating).
    #[inline]
    pub fn to_ns(self, value: u64) -> u64 {
        value.saturating_mul(self.ns_per_unit())
    }

    /// Integer count in this unit to nanoseconds, failing on overflow.
    #[inline]
    pub fn try_to_ns(self, value: u64) -> Result<u64, UnitsError> {
        value
            .checked_mul(self.ns_per_unit())
            .ok_or_else(|| UnitsError::Overflow(format!("{value} {self}")))
    }

    /// Nanoseconds to a (possibly fractional) count in this unit.
    #[inline]
    pub fn from_ns(self, ns: u64) -> f64 {
        ns as f64 / self.ns_per_unit() as f64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Ns => "ns",
            TimeUnit::Us => "us",
            TimeUnit::Ms => "ms",
            TimeUnit::S => "s",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = UnitsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ns" => Ok(TimeUnit::Ns),
            "us" | "µs" => Ok(TimeUnit::Us),
            "ms" => Ok(TimeUnit::Ms),
            "s" => Ok(TimeUnit::S),
            _ => Err(UnitsError::UnknownUnit(s.to_string())),
        }
    }
}

/// Convert a real-valued count of `unit` to nanoseconds, rounding to nearest.
pub fn to_ns(value: f64, unit: TimeUnit) -> Result<u64, UnitsError> {
    let ns = (value * unit.ns_per_unit() as f64).round();
    if !ns.is_finite() || ns >= u64::MAX as f64 {
        return Err(UnitsError::Overflow(format!("{value} {unit}")));
    }
    if ns < 0.0 {
        return Err(UnitsError::Negative(format!("{value} {unit}")));
    }
    Ok(ns as u64)
}

/// Parse "10 ms", "50us", "2.5 s" into nanoseconds.
pub fn parse_time(s: &str) -> Result<u64, UnitsError> {
    let raw = s.trim();
    if raw.is_empty() {
        return Err(UnitsError::Empty(s.to_string()));
    }
    let lower = raw.to_lowercase();
    // The unit is the trailing run of letters, so "5 hours" is not read as "s".
    let (number, unit) = lower.split_at(lower.trim_end_matches(char::is_alphabetic).len());
    if unit.is_empty() {
        return Err(UnitsError::UnknownUnit(s.to_string()));
    }
    let unit: TimeUnit = unit.parse().map_err(|_| UnitsError::UnknownUnit(s.to_string()))?;
    let number = number.trim_end();

    if number.is_empty() {
        return Err(UnitsError::NotANumber(s.to_string()));
    }
    if number.starts_with('-') {
        return Err(UnitsError::Negative(s.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| UnitsError::NotANumber(s.to_string()))?;
    if !value.is_finite() {
        return Err(UnitsError::NotANumber(s.to_string()));
    }
    to_ns(value, unit).map_err(|e| match e {
        UnitsError::Negative(_) => UnitsError::Negative(s.to_string()),
        _ => UnitsError::Overflow(s.to_string()),
    })
}

/// Tolerances used when two executions are compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Epsilons {
    pub time_ns: u64,
    pub numeric: f64,
}

impl Epsilons {
    pub const DEFAULT_TIME_US: u64 = 100;
    pub const DEFAULT_NUMERIC: f64 = 1e-5;

    pub fn new(time_us: u64, numeric: f64) -> Self {
        Self {
            time_ns: TimeUnit::Us.to_ns(time_us),
            numeric,
        }
    }

    /// Bit-exact comparison.
    pub fn exact() -> Self {
        Self {
            time_ns: 0,
            numeric: 0.0,
        }
    }
}

impl Default for Epsilons {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIME_US, Self::DEFAULT_NUMERIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_literals() {
        assert_eq!(parse_time("10 ms").unwrap(), 10 * NS_PER_MS);
        assert_eq!(parse_time("50 us").unwrap(), 50 * NS_PER_US);
        assert_eq!(parse_time("50us").unwrap(), 50 * NS_PER_US);
        assert_eq!(parse_time("7ns").unwrap(), 7);
        assert_eq!(parse_time("2 s").unwrap(), 2 * NS_PER_S);
        assert_eq!(parse_time(" 2.5 MS ").unwrap(), 2_500_000);
        assert_eq!(parse_time("0 ms").unwrap(), 0);
    }

    #[test]
    fn rejects_bad_literals() {
        assert!(matches!(parse_time(""), Err(UnitsError::Empty(_))));
        assert!(matches!(parse_time("10 min"), Err(UnitsError::UnknownUnit(_))));
        assert!(matches!(parse_time("ten ms"), Err(UnitsError::NotANumber(_))));
        assert!(matches!(parse_time("ms"), Err(UnitsError::NotANumber(_))));
        assert!(matches!(parse_time("-5 ms"), Err(UnitsError::Negative(_))));
        assert!(matches!(parse_time("10"), Err(UnitsError::UnknownUnit(_))));
        assert!(matches!(parse_time("5 hours"), Err(UnitsError::UnknownUnit(_))));
        assert!(matches!(parse_time("2 secs"), Err(UnitsError::UnknownUnit(_))));
    }

    #[test]
    fn error_names_offending_string() {
        let err = parse_time("3 parsecs").unwrap_err();
        assert!(err.to_string().contains("3 parsecs"));
    }

    #[test]
    fn unit_conversion() {
        assert_eq!(TimeUnit::Us.to_ns(200), 200_000);
        assert_eq!("us".parse::<TimeUnit>().unwrap(), TimeUnit::Us);
        assert!((TimeUnit::Ms.from_ns(1_500_000) - 1.5).abs() < 1e-12);
        assert_eq!(Epsilons::default().time_ns, 100_000);
        assert_eq!(TimeUnit::S.try_to_ns(3).unwrap(), 3 * NS_PER_S);
        assert!(matches!(TimeUnit::S.try_to_ns(u64::MAX), Err(UnitsError::Overflow(_))));
    }
}
