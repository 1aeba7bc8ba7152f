//! Local mirror of remote console state.
//!
//! One entry per `(path, format)`, last write wins. Entries are never removed
//! on disconnect, only flagged stale; the next authoritative value for that
//! path clears the flag.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faderproto::{AppState, ConsoleInfo, ParamValue, PathPattern, ValueFormat};
use parking_lot::RwLock;
use serde::Serialize;

use crate::channel::ConnectionState;

/// Who wrote a mirror entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueOrigin {
    /// Console push, GET reply or subscribe snapshot
    Server,
    /// Local SET not yet confirmed by the console
    Optimistic,
}

/// A mirrored parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterValue {
    pub path: String,
    pub format: ValueFormat,
    pub value: ParamValue,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
    pub origin: ValueOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never seen
    Unknown,
    /// Seen, but the connection dropped since, or a SET on it failed
    Stale,
    Fresh,
}

#[derive(Debug)]
pub struct StateMirror {
    values: DashMap<(String, ValueFormat), ParameterValue>,
    console_info: RwLock<Option<ConsoleInfo>>,
    app_state: RwLock<Option<AppState>>,
    connection: RwLock<ConnectionState>,
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMirror {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            console_info: RwLock::new(None),
            app_state: RwLock::new(None),
            connection: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self, path: &str, format: ValueFormat) -> Option<ParameterValue> {
        self.values
            .get(&(path.to_string(), format))
            .map(|entry| entry.value().clone())
    }

    pub fn freshness(&self, path: &str, format: ValueFormat) -> Freshness {
        match self.values.get(&(path.to_string(), format)) {
            None => Freshness::Unknown,
            Some(entry) if entry.stale => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    /// Record an authoritative value from the console.
    pub fn apply(&self, path: &str, format: ValueFormat, value: ParamValue) -> ParameterValue {
        self.write(path, format, value, ValueOrigin::Server)
    }

    /// Record a local write before the console confirms it.
    pub fn set_local_optimistic(
        &self,
        path: &str,
        format: ValueFormat,
        value: ParamValue,
    ) -> ParameterValue {
        self.write(path, format, value, ValueOrigin::Optimistic)
    }

    fn write(
        &self,
        path: &str,
        format: ValueFormat,
        value: ParamValue,
        origin: ValueOrigin,
    ) -> ParameterValue {
        let entry = ParameterValue {
            path: path.to_string(),
            format,
            value,
            timestamp: Utc::now(),
            stale: false,
            origin,
        };
        self.values
            .insert((path.to_string(), format), entry.clone());
        entry
    }

    /// Flag one entry stale. Returns false if there was no entry.
    pub fn mark_stale(&self, path: &str, format: ValueFormat) -> bool {
        match self.values.get_mut(&(path.to_string(), format)) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Flag an entry stale only if it still holds an unconfirmed local write.
    pub(crate) fn retract_optimistic(&self, path: &str, format: ValueFormat) {
        if let Some(mut entry) = self.values.get_mut(&(path.to_string(), format)) {
            if entry.origin == ValueOrigin::Optimistic {
                entry.stale = true;
            }
        }
    }

    /// Put back what the mirror held before a local write that never went out.
    pub(crate) fn restore_optimistic(
        &self,
        path: &str,
        format: ValueFormat,
        previous: Option<ParameterValue>,
    ) {
        let key = (path.to_string(), format);
        match previous {
            Some(previous) => {
                if let Some(mut entry) = self.values.get_mut(&key) {
                    if entry.origin == ValueOrigin::Optimistic {
                        *entry = previous;
                    }
                }
            }
            None => {
                self.values
                    .remove_if(&key, |_, entry| entry.origin == ValueOrigin::Optimistic);
            }
        }
    }

    /// The console accepted a local write without echoing it.
    pub(crate) fn confirm_optimistic(&self, path: &str, format: ValueFormat) {
        if let Some(mut entry) = self.values.get_mut(&(path.to_string(), format)) {
            if entry.origin == ValueOrigin::Optimistic {
                entry.origin = ValueOrigin::Server;
            }
        }
    }

    /// Flag every entry stale. Returns how many were touched.
    pub fn mark_all_stale(&self) -> usize {
        let mut count = 0;
        for mut entry in self.values.iter_mut() {
            entry.stale = true;
            count += 1;
        }
        count
    }

    /// Every entry in `format` whose path matches `pattern`, sorted by path.
    pub fn matching(&self, pattern: &PathPattern, format: ValueFormat) -> Vec<ParameterValue> {
        let mut found: Vec<ParameterValue> = self
            .values
            .iter()
            .filter(|entry| entry.key().1 == format && pattern.matches(&entry.key().0))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn console_info(&self) -> Option<ConsoleInfo> {
        self.console_info.read().clone()
    }

    pub(crate) fn set_console_info(&self, info: ConsoleInfo) {
        *self.console_info.write() = Some(info);
    }

    pub fn app_state(&self) -> Option<AppState> {
        self.app_state.read().clone()
    }

    pub(crate) fn set_app_state(&self, state: AppState) {
        *self.app_state.write() = Some(state);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.read()
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        *self.connection.write() = state;
    }
}
