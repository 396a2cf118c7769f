//! Request context management
//!
//! This module provides the incoming request handed over by the transport and
//! the [`RequestContext`] that holds per-request state while the pipeline runs.

use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::scope::{ApplicationScope, SessionScope};

/// Request as seen by the lifecycle core.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier, used for log correlation
    pub id: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Session token presented by the client, if any
    pub session_token: Option<String>,
}

impl IncomingRequest {
    /// Create a GET request for `path` with a fresh request id
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            session_token: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Add a header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => log::debug!("Ignoring invalid request header '{name}'"),
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-request state shared with the request-phase callbacks.
///
/// The scopes are borrowed for the duration of the request only; dropping the
/// context never tears them down.
pub struct RequestContext {
    request: IncomingRequest,
    application: Arc<ApplicationScope>,
    session: Option<Arc<SessionScope>>,
    deadline: Option<Instant>,
    committed: bool,

    /// Request-local variables (type-erased, thread-safe)
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new(
        request: IncomingRequest,
        application: Arc<ApplicationScope>,
        session: Option<Arc<SessionScope>>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            request,
            application,
            session,
            deadline,
            committed: false,
            vars: HashMap::new(),
        }
    }

    pub fn request(&self) -> &IncomingRequest {
        &self.request
    }

    pub fn application(&self) -> &Arc<ApplicationScope> {
        &self.application
    }

    /// Session scope, `None` when session management is off for this request
    pub fn session(&self) -> Option<&Arc<SessionScope>> {
        self.session.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Commit state of the response as last observed by the pipeline
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn observe_commit(&mut self, committed: bool) {
        self.committed = committed;
    }

    /// Store a typed value into the context
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the context
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }
}
