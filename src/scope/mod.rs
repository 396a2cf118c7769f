//! Application and session scopes
//!
//! Both scopes wrap a [`ScopeStore`] and add identity plus an idle timeout.
//! They dereference to their store, so callbacks read and write them with
//! `scope.get(..)` / `scope.set(..)` directly.

pub mod store;

use std::{
    fmt,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

pub use store::{Activity, ScopeStore};

use crate::core::Clock;

/// Behaviour shared by scopes that expire after a period of inactivity.
pub trait ExpiringScope: Send + Sync {
    /// Key the owning registry files this scope under
    fn scope_id(&self) -> &str;

    fn store(&self) -> &ScopeStore;

    fn idle_timeout(&self) -> Duration;

    /// `true` once the scope has sat idle for at least its timeout
    fn is_expired(&self, now: Instant) -> bool {
        self.store().activity().idle_for(now) >= self.idle_timeout()
    }

    fn touch(&self) {
        self.store().activity().touch();
    }
}

/// State shared by all requests for the lifetime of a running descriptor.
pub struct ApplicationScope {
    id: String,
    name: String,
    idle_timeout: Duration,
    store: ScopeStore,
}

impl ApplicationScope {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            idle_timeout,
            store: ScopeStore::new(clock),
        }
    }

    /// Descriptor identity this scope belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Informational application name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Instant {
        self.store.activity().created_at()
    }

    pub fn last_access(&self) -> Instant {
        self.store.activity().last_access()
    }
}

impl ExpiringScope for ApplicationScope {
    fn scope_id(&self) -> &str {
        &self.id
    }

    fn store(&self) -> &ScopeStore {
        &self.store
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Deref for ApplicationScope {
    type Target = ScopeStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl fmt::Debug for ApplicationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationScope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("idle_timeout", &self.idle_timeout)
            .field("keys", &self.store.len())
            .finish()
    }
}

/// State shared by all requests presenting the same session token.
pub struct SessionScope {
    token: String,
    idle_timeout: Duration,
    application: Arc<ApplicationScope>,
    store: ScopeStore,
}

impl SessionScope {
    pub fn new(
        token: impl Into<String>,
        idle_timeout: Duration,
        application: Arc<ApplicationScope>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            token: token.into(),
            idle_timeout,
            application,
            store: ScopeStore::new(clock),
        }
    }

    /// Opaque token identifying this session to the client
    pub fn session_id(&self) -> &str {
        &self.token
    }

    /// Application scope the session was created under
    pub fn application(&self) -> &Arc<ApplicationScope> {
        &self.application
    }

    pub fn created_at(&self) -> Instant {
        self.store.activity().created_at()
    }

    pub fn last_access(&self) -> Instant {
        self.store.activity().last_access()
    }
}

impl ExpiringScope for SessionScope {
    fn scope_id(&self) -> &str {
        &self.token
    }

    fn store(&self) -> &ScopeStore {
        &self.store
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Deref for SessionScope {
    type Target = ScopeStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("token", &self.token)
            .field("application", &self.application.id())
            .field("idle_timeout", &self.idle_timeout)
            .field("keys", &self.store.len())
            .finish()
    }
}
