//! Operator parameters.
//!
//! Parameters are carried untyped on the graph (so a document can describe any
//! operator) and validated when a plan is built. `ParamReader` is the typed view
//! operators use to pull their fields; it remembers which names were consumed so
//! that misspelled parameters are rejected rather than silently ignored.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::{parse_time, to_ns, TimeUnit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "integer",
            ParamValue::Float(_) => "number",
            ParamValue::Str(_) => "string",
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

pub type Params = BTreeMap<String, ParamValue>;

/// Build a `Params` map inline: `params! { "tau_ms" => 10.0, "n" => 4 }`.
#[macro_export]
macro_rules! params {
    () => { $crate::params::Params::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut p = $crate::params::Params::new();
        $( p.insert(($key).to_string(), $crate::params::ParamValue::from($value)); )+
        p
    }};
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("parameter '{param}': {reason}")]
    Invalid { param: String, reason: String },
    #[error("parameter '{param}': expected {expected}, got {found}")]
    WrongType {
        param: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("parameter '{param}' is required")]
    Missing { param: String },
    #[error("unknown parameter '{param}'")]
    Unknown { param: String },
}

impl ParamError {
    pub fn invalid(param: &str, reason: impl Into<String>) -> Self {
        ParamError::Invalid {
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    pub fn param(&self) -> &str {
        match self {
            ParamError::Invalid { param, .. }
            | ParamError::WrongType { param, .. }
            | ParamError::Missing { param }
            | ParamError::Unknown { param } => param,
        }
    }
}

pub type ParamResult<T> = Result<T, ParamError>;

pub struct ParamReader<'a> {
    params: &'a Params,
    used: BTreeSet<&'a str>,
}

impl<'a> ParamReader<'a> {
    pub fn new(params: &'a Params) -> Self {
        Self {
            params,
            used: BTreeSet::new(),
        }
    }

    fn take(&mut self, name: &str) -> Option<&'a ParamValue> {
        let params: &'a Params = self.params;
        let (key, value) = params.get_key_value(name)?;
        self.used.insert(key.as_str());
        Some(value)
    }

    pub fn f64_opt(&mut self, name: &str) -> ParamResult<Option<f64>> {
        match self.take(name) {
            None => Ok(None),
            Some(ParamValue::Float(v)) if v.is_finite() => Ok(Some(*v)),
            Some(ParamValue::Float(_)) => Err(ParamError::invalid(name, "must be finite")),
            Some(ParamValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(ParamError::WrongType {
                param: name.to_string(),
                expected: "number",
                found: other.type_name(),
            }),
        }
    }

    pub fn f64_or(&mut self, name: &str, default: f64) -> ParamResult<f64> {
        Ok(self.f64_opt(name)?.unwrap_or(default))
    }

    pub fn i64_or(&mut self, name: &str, default: i64) -> ParamResult<i64> {
        match self.take(name) {
            None => Ok(default),
            Some(ParamValue::Int(v)) => Ok(*v),
            Some(ParamValue::Float(v)) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            Some(ParamValue::Float(_)) => Err(ParamError::invalid(name, "must be an integer")),
            Some(other) => Err(ParamError::WrongType {
                param: name.to_string(),
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    /// Integer constrained to `[min, max]`.
    pub fn int_in(&mut self, name: &str, default: i64, min: i64, max: i64) -> ParamResult<i64> {
        let v = self.i64_or(name, default)?;
        if v < min || v > max {
            return Err(ParamError::invalid(
                name,
                format!("{v} is outside [{min}, {max}]"),
            ));
        }
        Ok(v)
    }

    pub fn bool_or(&mut self, name: &str, default: bool) -> ParamResult<bool> {
        match self.take(name) {
            None => Ok(default),
            Some(ParamValue::Bool(v)) => Ok(*v),
            Some(other) => Err(ParamError::WrongType {
                param: name.to_string(),
                expected: "bool",
                found: other.type_name(),
            }),
        }
    }

    pub fn str_or(&mut self, name: &str, default: &'a str) -> ParamResult<&'a str> {
        match self.take(name) {
            None => Ok(default),
            Some(ParamValue::Str(v)) => Ok(v.as_str()),
            Some(other) => Err(ParamError::WrongType {
                param: name.to_string(),
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    /// Duration in nanoseconds. Numbers are read in `unit` (the unit the
    /// parameter name carries, e.g. `tau_ms`), strings as time literals.
    pub fn duration_opt(&mut self, name: &str, unit: TimeUnit) -> ParamResult<Option<u64>> {
        let ns = match self.take(name) {
            None => return Ok(None),
            Some(ParamValue::Int(v)) if *v < 0 => {
                return Err(ParamError::invalid(name, "must not be negative"))
            }
            Some(ParamValue::Int(v)) => unit.to_ns(*v as u64),
            Some(ParamValue::Float(v)) => {
                to_ns(*v, unit).map_err(|e| ParamError::invalid(name, e.to_string()))?
            }
            Some(ParamValue::Str(s)) => {
                parse_time(s).map_err(|e| ParamError::invalid(name, e.to_string()))?
            }
            Some(other) => {
                return Err(ParamError::WrongType {
                    param: name.to_string(),
                    expected: "duration",
                    found: other.type_name(),
                })
            }
        };
        Ok(Some(ns))
    }

    pub fn duration_or(&mut self, name: &str, unit: TimeUnit, default_ns: u64) -> ParamResult<u64> {
        Ok(self.duration_opt(name, unit)?.unwrap_or(default_ns))
    }

    /// Reject any parameter that no accessor asked for.
    pub fn finish(self) -> ParamResult<()> {
        match self
            .params
            .keys()
            .find(|k| !self.used.contains(k.as_str()))
        {
            Some(k) => Err(ParamError::Unknown { param: k.clone() }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_reads_and_defaults() {
        let p = params! { "tau_ms" => 10.0, "n" => 4i64, "log" => false, "window" => "rect" };
        let mut r = ParamReader::new(&p);
        assert_eq!(r.duration_or("tau_ms", TimeUnit::Ms, 0).unwrap(), 10_000_000);
        assert_eq!(r.int_in("n", 1, 1, 1024).unwrap(), 4);
        assert!(!r.bool_or("log", true).unwrap());
        assert_eq!(r.str_or("window", "hann").unwrap(), "rect");
        assert_eq!(r.f64_or("v_th", 1.0).unwrap(), 1.0);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn durations_accept_time_literals() {
        let p = params! { "refractory_us" => "2 ms" };
        let mut r = ParamReader::new(&p);
        assert_eq!(r.duration_or("refractory_us", TimeUnit::Us, 0).unwrap(), 2_000_000);
    }

    #[test]
    fn unknown_and_mistyped_parameters_fail() {
        let p = params! { "tau_ms" => 10.0, "tua_ms" => 3.0 };
        let mut r = ParamReader::new(&p);
        r.duration_or("tau_ms", TimeUnit::Ms, 0).unwrap();
        assert_eq!(
            r.finish().unwrap_err(),
            ParamError::Unknown {
                param: "tua_ms".into()
            }
        );

        let p = params! { "n" => "many" };
        let mut r = ParamReader::new(&p);
        assert!(matches!(r.i64_or("n", 1), Err(ParamError::WrongType { .. })));
    }

    #[test]
    fn range_checks() {
        let p = params! { "min_count" => 0i64 };
        let mut r = ParamReader::new(&p);
        let err = r.int_in("min_count", 2, 1, 2).unwrap_err();
        assert_eq!(err.param(), "min_count");
    }
}
