//! Scope registries
//!
//! [`ScopeTable`] is the concurrent slot map both registries are built on.
//! Each id maps to a slot that is filled at most once; callers racing to
//! create the same scope wait on the slot and receive the same instance.

pub mod application;
pub mod session;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

pub use application::ApplicationRegistry;
pub use session::{ResolvedSession, SessionRegistry};

use crate::{core::Clock, scope::ExpiringScope};

pub(crate) type Slot<S> = Arc<OnceCell<Arc<S>>>;

/// Result of looking up an id in a [`ScopeTable`].
pub(crate) enum Lookup<S> {
    /// A live scope; it has been touched
    Live(Arc<S>),
    /// The scope has idled past its timeout and should be evicted
    Expired(Slot<S>),
    /// Creation has not completed yet
    Pending(Slot<S>),
}

pub(crate) struct ScopeTable<S> {
    slots: DashMap<String, Slot<S>>,
    clock: Arc<dyn Clock>,
}

impl<S: ExpiringScope> ScopeTable<S> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Look up `id`, inserting an empty slot when absent
    pub fn find_or_reserve(&self, id: &str) -> Lookup<S> {
        let slot = self.slots.entry(id.to_string()).or_default().clone();
        self.classify(slot)
    }

    /// Look up `id` without reserving anything
    pub fn find(&self, id: &str) -> Option<Lookup<S>> {
        let slot = self.slots.get(id).map(|entry| entry.value().clone())?;
        Some(self.classify(slot))
    }

    /// Reserve an empty slot under a fresh id produced by `mint`.
    ///
    /// `mint` is retried until it yields an id no other slot uses.
    pub fn reserve_new(&self, mut mint: impl FnMut() -> String) -> (String, Slot<S>) {
        loop {
            let id = mint();
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.slots.entry(id.clone()) {
                let slot: Slot<S> = Arc::default();
                entry.insert(slot.clone());
                return (id, slot);
            }
            log::warn!("Minted id collided with an existing scope, retrying");
        }
    }

    fn classify(&self, slot: Slot<S>) -> Lookup<S> {
        let now = self.clock.now();
        match slot.get().cloned() {
            Some(scope) if scope.is_expired(now) => Lookup::Expired(slot),
            Some(scope) => {
                scope.touch();
                Lookup::Live(scope)
            }
            None => Lookup::Pending(slot),
        }
    }

    /// Remove `slot` if it is still the one filed under `id`.
    ///
    /// Returns the scope only to the caller that actually removed it, so
    /// teardown runs once no matter how many callers race here.
    pub fn evict(&self, id: &str, slot: &Slot<S>) -> Option<Arc<S>> {
        self.slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot))
            .and_then(|(_, removed)| removed.get().cloned())
    }

    /// Remove `slot` if it is still filed under `id` and its scope is expired
    /// at the moment of removal.
    ///
    /// A scope touched after it was found expired stays live.
    pub fn evict_expired(&self, id: &str, slot: &Slot<S>) -> Option<Arc<S>> {
        let now = self.clock.now();
        self.slots
            .remove_if(id, |_, current| {
                Arc::ptr_eq(current, slot)
                    && current.get().is_some_and(|scope| scope.is_expired(now))
            })
            .and_then(|(_, removed)| removed.get().cloned())
    }

    /// Remove whichever slot under `id` holds exactly `scope`
    pub fn evict_scope(&self, id: &str, scope: &Arc<S>) -> Option<Arc<S>> {
        self.slots
            .remove_if(id, |_, current| {
                current.get().is_some_and(|held| Arc::ptr_eq(held, scope))
            })
            .and_then(|(_, removed)| removed.get().cloned())
    }

    /// Drop a slot whose creation failed
    pub fn discard(&self, id: &str, slot: &Slot<S>) {
        self.slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot) && current.get().is_none());
    }

    /// Slots holding scopes that are expired right now. Does not touch them.
    pub fn expired(&self) -> Vec<(String, Slot<S>)> {
        let now = self.clock.now();
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .get()
                    .is_some_and(|scope| scope.is_expired(now))
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Slots whose scope matches `predicate`. Does not touch them.
    pub fn matching(&self, predicate: impl Fn(&S) -> bool) -> Vec<(String, Slot<S>)> {
        self.slots
            .iter()
            .filter(|entry| entry.value().get().is_some_and(|scope| predicate(scope)))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of live (created) scopes
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// The live scope under `id`, without touching it
    pub fn peek(&self, id: &str) -> Option<Arc<S>> {
        self.slots
            .get(id)
            .and_then(|entry| entry.value().get().cloned())
    }
}

/// Counts of scopes torn down by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub applications: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.sessions + self.applications
    }
}
