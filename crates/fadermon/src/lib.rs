//! fadermon - command-line monitor for mixing consoles
//!
//! This library provides:
//! - `commands`: watch/get/set/meter/info/config implementations
//! - `telemetry`: stderr logging, plus OTLP export when configured

pub mod commands;
pub mod telemetry;
