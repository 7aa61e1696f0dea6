//! Driver abstraction over heterogeneous laboratory hardware.
//!
//! Every hardware backend (laser, wavelength meter, pulse generator, ...)
//! implements the [`Driver`] trait, hiding vendor wire protocols from the rest
//! of the system. Actuating hardware is the domain of this layer only; no
//! other component talks to hardware directly.
//!
//! # Contract
//!
//! - [`Driver::open`] establishes the hardware connection from configuration
//!   parameters. Failure is isolated to this driver.
//! - [`Driver::call`] dispatches a named operation with typed arguments.
//! - [`Driver::get`] / [`Driver::set`] read and write named attributes;
//!   `set` rejects out-of-range values with a validation error.
//! - [`Driver::close`] is idempotent and must leave the hardware in a safe
//!   state even after a failed or partial `open`.
//!
//! # Thread Safety
//!
//! Drivers are `Send` so the instrument server can move each one into its own
//! worker task. A driver instance is exclusively owned by the server that
//! opened it; serialization of calls is enforced by the worker, not here.

pub mod mock;
pub mod registry;
pub mod sim;

use crate::error::LabResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Strongly-typed argument and return value for driver operations.
///
/// Serialized untagged so the wire representation is plain JSON scalars,
/// arrays, and objects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text value.
    String(String),
    /// Ordered list of values.
    List(Vec<ParamValue>),
    /// String-keyed map of values.
    Map(HashMap<String, ParamValue>),
    /// Absent value.
    Null,
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(fl) => write!(f, "{}", fl),
            ParamValue::String(s) => write!(f, "{}", s),
            ParamValue::List(l) => write!(f, "{:?}", l),
            ParamValue::Map(m) => write!(f, "{:?}", m),
            ParamValue::Null => write!(f, "null"),
        }
    }
}

impl ParamValue {
    /// Extract value as f64, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract value as &str.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u16> for ParamValue {
    fn from(value: u16) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::List(value.into_iter().map(ParamValue::Float).collect())
    }
}

/// Connection parameters handed to [`Driver::open`], straight from the
/// `connection_params` table of the driver's configuration entry.
pub type ConnectionParams = HashMap<String, toml::Value>;

/// Health of a driver as advertised by its server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverHealth {
    /// Open succeeded; the driver is accepting calls.
    Available,
    /// Open failed; calls are rejected but the server keeps running.
    Failed,
    /// The driver has been closed.
    Closed,
}

impl fmt::Display for DriverHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverHealth::Available => write!(f, "available"),
            DriverHealth::Failed => write!(f, "failed"),
            DriverHealth::Closed => write!(f, "closed"),
        }
    }
}

/// Uniform capability contract implemented by every hardware backend.
#[async_trait]
pub trait Driver: Send {
    /// Alias for the device, unique within its server.
    fn name(&self) -> &str;

    /// Establish the hardware connection.
    ///
    /// Called once at server startup. A failure here marks the driver
    /// unavailable without affecting the rest of the server.
    async fn open(&mut self, params: &ConnectionParams) -> LabResult<()>;

    /// Invoke a named operation with typed arguments.
    async fn call(&mut self, method: &str, args: &[ParamValue]) -> LabResult<ParamValue>;

    /// Read an observable attribute.
    async fn get(&mut self, attribute: &str) -> LabResult<ParamValue>;

    /// Write an attribute, rejecting out-of-range values.
    async fn set(&mut self, attribute: &str, value: ParamValue) -> LabResult<()>;

    /// Release the hardware, leaving it in a safe state.
    ///
    /// Idempotent, and safe to call after a failed `open`.
    async fn close(&mut self) -> LabResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_serde_is_plain_json() {
        let v = ParamValue::Float(737.8);
        assert_eq!(serde_json::to_string(&v).unwrap(), "737.8");

        let parsed: ParamValue = serde_json::from_str("[1, 2.5, \"ok\"]").unwrap();
        match parsed {
            ParamValue::List(items) => {
                assert_eq!(items[0], ParamValue::Int(1));
                assert_eq!(items[1], ParamValue::Float(2.5));
                assert_eq!(items[2], ParamValue::String("ok".into()));
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_param_value_conversions() {
        assert_eq!(ParamValue::from(5i64).as_f64(), Some(5.0));
        assert_eq!(ParamValue::from(2.5).as_i64(), None);
        assert_eq!(ParamValue::from("shg").as_str(), Some("shg"));
        assert_eq!(ParamValue::Null.as_f64(), None);
    }
}
