//! Versioned, path-addressable store for trading state
//!
//! Intended for low-volume, high-criticality values (signal, orders, runner
//! status). Every successful update bumps the entry's version by exactly one,
//! notifies matching listeners, then publishes `state.<path>` on the attached
//! event bus. The bus publish happens after the commit, so an observer of the
//! event always reads a value at least as new as the event.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::event_bus::EventBus;
use super::topic;
use crate::error::EngineError;

/// Topic prefix for state change events
pub const STATE_TOPIC_PREFIX: &str = "state.";

/// Validated dot-hierarchical key, e.g. `trading.pnl`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatePath(String);

impl StatePath {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let valid = !raw.is_empty()
            && raw.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(EngineError::InvalidPath(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic used when this path changes
    pub fn topic(&self) -> String {
        format!("{}{}", STATE_TOPIC_PREFIX, self.0)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StatePath {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StatePath {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StatePath> for String {
    fn from(path: StatePath) -> Self {
        path.0
    }
}

/// Tagged value stored at a path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl StateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub path: StatePath,
    pub value: StateValue,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`StateStore::get`]
#[derive(Debug, Clone, PartialEq)]
pub struct StateReading {
    pub value: StateValue,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub age: Duration,
}

/// Full copy of the store at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<StateEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StateEntry) + Send + Sync>;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<StatePath, StateEntry>,
    listeners: Vec<(ListenerId, String, Listener)>,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    /// Serializes commit → notify → publish so events leave in version order
    writer: ReentrantMutex<()>,
    bus: Option<Arc<EventBus>>,
    next_listener: AtomicU64,
}

impl StateStore {
    /// Store without an event bus (e.g. a client-side mirror)
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            writer: ReentrantMutex::new(()),
            bus: None,
            next_listener: AtomicU64::new(1),
        }
    }

    /// Store that publishes every committed update on `bus`
    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    /// Write `value` at `path`, bumping its version (last writer wins)
    pub fn update(&self, path: &str, value: impl Into<StateValue>) -> Result<StateEntry, EngineError> {
        let path = StatePath::parse(path)?;
        let value = value.into();
        let _writer = self.writer.lock();

        let (entry, listeners) = {
            let mut inner = self.inner.lock();
            let version = inner.entries.get(&path).map(|e| e.version).unwrap_or(0) + 1;
            let entry = StateEntry {
                path: path.clone(),
                value,
                version,
                updated_at: Utc::now(),
            };
            inner.entries.insert(path, entry.clone());
            let listeners = matching_listeners(&inner, &entry);
            (entry, listeners)
        };

        for listener in listeners {
            listener(&entry);
        }

        if let Some(bus) = &self.bus {
            let payload = serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null);
            bus.publish(&entry.path.topic(), payload, "state_store");
        }

        debug!(path = %entry.path, version = entry.version, "State updated");
        Ok(entry)
    }

    /// Apply an entry produced elsewhere (log replay, remote mirror). Only
    /// newer versions are applied; listeners fire, the bus does not.
    pub fn apply_entry(&self, entry: StateEntry) -> bool {
        let _writer = self.writer.lock();

        let listeners = {
            let mut inner = self.inner.lock();
            let current = inner.entries.get(&entry.path).map(|e| e.version).unwrap_or(0);
            if entry.version <= current {
                return false;
            }
            inner.entries.insert(entry.path.clone(), entry.clone());
            matching_listeners(&inner, &entry)
        };

        for listener in listeners {
            listener(&entry);
        }
        true
    }

    pub fn get(&self, path: &str) -> Option<StateReading> {
        let path = StatePath::parse(path).ok()?;
        let inner = self.inner.lock();
        inner.entries.get(&path).map(|e| StateReading {
            value: e.value.clone(),
            version: e.version,
            updated_at: e.updated_at,
            age: Utc::now() - e.updated_at,
        })
    }

    pub fn version(&self, path: &str) -> u64 {
        self.get(path).map(|r| r.version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a callback for an exact path, `prefix.*`, or `*`
    pub fn on_change<F>(&self, pattern: &str, callback: F) -> ListenerId
    where
        F: Fn(&StateEntry) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .lock()
            .listeners
            .push((id, pattern.to_string(), Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(l, _, _)| *l != id);
        before != inner.listeners.len()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            taken_at: Utc::now(),
            entries: inner.entries.values().cloned().collect(),
        }
    }

    /// Replace the whole map with `snapshot` without notifying anyone
    pub fn restore(&self, snapshot: &StateSnapshot) {
        let _writer = self.writer.lock();
        let mut inner = self.inner.lock();
        inner.entries = snapshot
            .entries
            .iter()
            .map(|e| (e.path.clone(), e.clone()))
            .collect();
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matching_listeners(inner: &Inner, entry: &StateEntry) -> Vec<Listener> {
    inner
        .listeners
        .iter()
        .filter(|(_, pattern, _)| topic::matches(pattern, entry.path.as_str()))
        .map(|(_, _, l)| l.clone())
        .collect()
}
