//! Parameter values and the small records the console reports about itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a parameter value is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    /// Engineering units (dB, Hz, ms, ...)
    Val,
    /// Normalized to 0..1 regardless of physical unit
    Norm,
}

impl ValueFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueFormat::Val => "val",
            ValueFormat::Norm => "norm",
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a format string is neither `val` nor `norm`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown value format: {0:?} (expected \"val\" or \"norm\")")]
pub struct UnknownFormat(pub String);

impl FromStr for ValueFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "val" => Ok(ValueFormat::Val),
            "norm" => Ok(ValueFormat::Norm),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// A parameter value as carried in SET/GET/PUSH bodies.
///
/// Untagged so the wire carries plain JSON scalars: `0.75`, `true`, `"Vocals"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a command-line style literal: `true`/`false`, a number, or text.
    pub fn parse_literal(s: &str) -> Self {
        match s {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => s
                .parse::<f64>()
                .map(ParamValue::Number)
                .unwrap_or_else(|_| ParamValue::Text(s.to_string())),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Number(v as f64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// One `(path, format, value)` triple, used in subscribe snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
    pub path: String,
    pub format: ValueFormat,
    pub value: ParamValue,
}

impl ParamUpdate {
    pub fn new(path: impl Into<String>, format: ValueFormat, value: impl Into<ParamValue>) -> Self {
        Self {
            path: path.into(),
            format,
            value: value.into(),
        }
    }
}

/// Console identity, reported on `console.info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Application state, reported on `app.state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub state: String,
    /// Fields this client doesn't interpret, kept as received
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AppState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            extra: serde_json::Map::new(),
        }
    }
}
