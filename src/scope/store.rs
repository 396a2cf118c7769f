//! Expiring key-value storage shared by the application and session scopes.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::Clock;

/// Creation and last-access bookkeeping for a scope.
///
/// The last access is stored as a nanosecond offset from creation so that
/// touching a scope is a single atomic operation.
pub struct Activity {
    clock: Arc<dyn Clock>,
    created_at: Instant,
    last_access: AtomicU64,
}

impl Activity {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let created_at = clock.now();
        Self {
            clock,
            created_at,
            last_access: AtomicU64::new(0),
        }
    }

    /// Record an access at the clock's current time
    pub fn touch(&self) {
        let offset = self
            .clock
            .now()
            .saturating_duration_since(self.created_at)
            .as_nanos();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        // concurrent touches must never move the timestamp backwards
        self.last_access.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_access.load(Ordering::Acquire))
    }

    /// Time since the last access, measured at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// String-keyed map of untyped values.
///
/// Operations on the same key are mutually exclusive; there is no ordering
/// across keys. Reads and writes touch the owning scope unless stated
/// otherwise.
pub struct ScopeStore {
    values: DashMap<String, Value>,
    activity: Activity,
}

impl ScopeStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            activity: Activity::new(clock),
        }
    }

    /// Get a value, `None` when the key is absent
    pub fn get(&self, key: &str) -> Option<Value> {
        self.activity.touch();
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Get a value deserialized into `T`.
    ///
    /// Returns `None` when the key is absent or holds a value of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Insert or replace a value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.activity.touch();
        self.values.insert(key.into(), value.into());
    }

    /// Remove a value, returning the previous one
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.activity.touch();
        self.values.remove(key).map(|(_, value)| value)
    }

    /// Check whether a key is present. Does not touch the scope.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Read-modify-write under the key's lock.
    ///
    /// `f` receives the current value (if any) and returns the value to store,
    /// which is also returned to the caller. Concurrent `update`s of one key
    /// are serialized, unlike a separate `get` followed by `set`.
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        self.activity.touch();
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = f(Some(entry.get()));
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                let next = f(None);
                entry.insert(next.clone());
                next
            }
        }
    }

    /// Read a value without touching the scope
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Copy of every entry, without touching the scope
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }
}
