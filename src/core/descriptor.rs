//! Application descriptor contract
//!
//! A descriptor declares the settings of one application and the callbacks
//! the engine fires around its scopes and requests. Every callback has a
//! default, so a descriptor only implements the phases it cares about.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    context::{IncomingRequest, RequestContext},
    error::{BoxError, CallbackResult, LifecycleError},
    traits::ResponseSink,
};
use crate::scope::{ApplicationScope, SessionScope};

/// Outcome of a start-phase callback.
#[derive(Debug)]
pub enum Signal {
    /// Proceed with the pipeline
    Continue,
    /// Stop the pipeline on purpose; not an error
    Abort,
    /// The callback failed
    Fail(BoxError),
}

impl Signal {
    pub fn fail(err: impl Into<BoxError>) -> Self {
        Signal::Fail(err.into())
    }
}

impl From<bool> for Signal {
    fn from(proceed: bool) -> Self {
        if proceed {
            Signal::Continue
        } else {
            Signal::Abort
        }
    }
}

impl From<CallbackResult<Signal>> for Signal {
    fn from(result: CallbackResult<Signal>) -> Self {
        result.unwrap_or_else(Signal::Fail)
    }
}

/// Runtime settings of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSettings {
    /// Informational name, also used as the descriptor identity
    pub name: String,
    pub application_timeout: Duration,
    pub session_management: bool,
    pub session_timeout: Duration,
    /// Issue the session cookie automatically when a session is created
    pub set_client_cookies: bool,
    /// `None` leaves requests unbounded
    pub request_timeout: Option<Duration>,
    pub session_cookie_name: String,
}

impl Default for DescriptorSettings {
    fn default() -> Self {
        Self {
            name: "Application".to_string(),
            application_timeout: Duration::from_secs(5 * 60),
            session_management: true,
            session_timeout: Duration::from_secs(20 * 60),
            set_client_cookies: true,
            request_timeout: None,
            session_cookie_name: "CFID".to_string(),
        }
    }
}

#[async_trait]
pub trait ApplicationDescriptor: Send + Sync {
    fn settings(&self) -> &DescriptorSettings;

    /// Identity the application scope is registered under
    fn id(&self) -> &str {
        &self.settings().name
    }

    /// Whether the given request participates in session management.
    ///
    /// Defaults to the configured setting; descriptors may decide per request.
    fn session_management(&self, _request: &IncomingRequest) -> bool {
        self.settings().session_management
    }

    /// Initialize a freshly created application scope.
    ///
    /// Only [`Signal::Continue`] makes the scope live.
    async fn on_application_start(
        &self,
        _application: &ApplicationScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        Signal::Continue
    }

    async fn on_session_start(
        &self,
        _application: &ApplicationScope,
        _session: &SessionScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        Ok(())
    }

    /// Gate the request; [`Signal::Abort`] skips `on_request` without error.
    async fn on_request_start(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        Signal::Continue
    }

    /// Main request handler
    async fn on_request(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        Ok(())
    }

    async fn on_request_end(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        Ok(())
    }

    async fn on_session_end(
        &self,
        _application: &ApplicationScope,
        _session: &SessionScope,
    ) -> CallbackResult {
        Ok(())
    }

    async fn on_application_end(&self, _application: &ApplicationScope) -> CallbackResult {
        Ok(())
    }

    /// Handle a routed failure.
    ///
    /// `request` and `response` are `None` for failures raised outside a
    /// request, such as teardown during an expiry sweep.
    async fn on_error(
        &self,
        _error: &LifecycleError,
        _request: Option<&IncomingRequest>,
        _response: Option<&mut dyn ResponseSink>,
    ) -> CallbackResult {
        Ok(())
    }
}
