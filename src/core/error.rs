//! Lifecycle error taxonomy
//!
//! Every failure the engine observes is folded into a [`LifecycleError`] so
//! that routing and tests can discriminate by kind instead of by message.

use std::fmt;

/// Boxed error returned by descriptor callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by descriptor callbacks.
pub type CallbackResult<T = ()> = std::result::Result<T, BoxError>;

/// Lifecycle phase a callback belongs to, used to label handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ApplicationStart,
    SessionStart,
    RequestStart,
    Request,
    RequestEnd,
    SessionEnd,
    ApplicationEnd,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ApplicationStart => "onApplicationStart",
            Phase::SessionStart => "onSessionStart",
            Phase::RequestStart => "onRequestStart",
            Phase::Request => "onRequest",
            Phase::RequestEnd => "onRequestEnd",
            Phase::SessionEnd => "onSessionEnd",
            Phase::ApplicationEnd => "onApplicationEnd",
            Phase::Error => "onError",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the lifecycle engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Application scope creation was declined or failed
    ApplicationUnavailable(String),

    /// Session scope creation failed
    SessionCreationFailed(String),

    /// The per-request deadline elapsed before the request finished
    RequestTimeout(String),

    /// A request-phase callback returned an error or panicked
    HandlerFailure { phase: Phase, message: String },

    /// A teardown callback failed while a scope was being expired
    TeardownFailure { phase: Phase, message: String },

    /// The error hook itself failed; never routed again
    ErrorHookFailure(String),
}

/// Discriminant of [`LifecycleError`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ApplicationUnavailable,
    SessionCreationFailed,
    RequestTimeout,
    HandlerFailure,
    TeardownFailure,
    ErrorHookFailure,
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::ApplicationUnavailable(_) => ErrorKind::ApplicationUnavailable,
            LifecycleError::SessionCreationFailed(_) => ErrorKind::SessionCreationFailed,
            LifecycleError::RequestTimeout(_) => ErrorKind::RequestTimeout,
            LifecycleError::HandlerFailure { .. } => ErrorKind::HandlerFailure,
            LifecycleError::TeardownFailure { .. } => ErrorKind::TeardownFailure,
            LifecycleError::ErrorHookFailure(_) => ErrorKind::ErrorHookFailure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            LifecycleError::ApplicationUnavailable(msg)
            | LifecycleError::SessionCreationFailed(msg)
            | LifecycleError::RequestTimeout(msg)
            | LifecycleError::ErrorHookFailure(msg) => msg,
            LifecycleError::HandlerFailure { message, .. }
            | LifecycleError::TeardownFailure { message, .. } => message,
        }
    }

    /// Phase of the callback that raised this error, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            LifecycleError::HandlerFailure { phase, .. }
            | LifecycleError::TeardownFailure { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::ApplicationUnavailable(msg) => {
                write!(f, "Application unavailable: {msg}")
            }
            LifecycleError::SessionCreationFailed(msg) => {
                write!(f, "Session creation failed: {msg}")
            }
            LifecycleError::RequestTimeout(msg) => write!(f, "Request timeout: {msg}"),
            LifecycleError::HandlerFailure { phase, message } => {
                write!(f, "Handler failure in {phase}: {message}")
            }
            LifecycleError::TeardownFailure { phase, message } => {
                write!(f, "Teardown failure in {phase}: {message}")
            }
            LifecycleError::ErrorHookFailure(msg) => write!(f, "Error hook failure: {msg}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<LifecycleError> for Box<pingora_error::Error> {
    fn from(err: LifecycleError) -> Self {
        pingora_error::Error::explain(pingora_error::ErrorType::InternalError, err.to_string())
    }
}

/// Result type alias for lifecycle operations
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
