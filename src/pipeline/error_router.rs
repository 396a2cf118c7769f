//! Failure boundary around descriptor callbacks
//!
//! Every callback runs inside [`ErrorRouter::guard`] or
//! [`ErrorRouter::guard_signal`], which turn returned errors and panics into a
//! [`LifecycleError`]. Routed failures reach the descriptor's `on_error` hook
//! once; a failing hook is logged and swallowed.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{error, warn};

use crate::core::{
    ApplicationDescriptor, CallbackResult, IncomingRequest, LifecycleError, LifecycleResult,
    Phase, ResponseSink, Signal,
};

pub struct ErrorRouter {
    descriptor: Arc<dyn ApplicationDescriptor>,
}

impl ErrorRouter {
    pub fn new(descriptor: Arc<dyn ApplicationDescriptor>) -> Self {
        Self { descriptor }
    }

    /// Run a callback that returns a result, catching errors and panics
    pub async fn guard<T, F>(&self, phase: Phase, callback: F) -> LifecycleResult<T>
    where
        F: Future<Output = CallbackResult<T>>,
    {
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(failure(phase, e.to_string())),
            Err(panic) => Err(failure(phase, panic_message(panic.as_ref()))),
        }
    }

    /// Run a start-phase callback; a panic becomes [`Signal::Fail`]
    pub async fn guard_signal<F>(&self, phase: Phase, callback: F) -> Signal
    where
        F: Future<Output = Signal>,
    {
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(signal) => signal,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("{phase} panicked: {message}");
                Signal::fail(message)
            }
        }
    }

    /// Hand a failure to the descriptor's error hook.
    ///
    /// `request` and `response` are absent for failures raised outside a
    /// request. [`LifecycleError::ErrorHookFailure`] is only logged.
    pub async fn route(
        &self,
        err: &LifecycleError,
        request: Option<&IncomingRequest>,
        response: Option<&mut dyn ResponseSink>,
    ) {
        if let LifecycleError::ErrorHookFailure(_) = err {
            error!("{err}");
            return;
        }

        match request {
            Some(request) => warn!("Request {} failed: {err}", request.id),
            None => warn!("Background failure: {err}"),
        }

        if let Some(response) = &response {
            if response.is_committed() {
                warn!("Response already committed; error output may not reach the client");
            }
        }

        let hook = self.descriptor.on_error(err, request, response);
        let hook_failure = match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        if let Some(message) = hook_failure {
            error!("{}", LifecycleError::ErrorHookFailure(message));
        }
    }
}

/// Classify a callback failure by the phase that raised it
fn failure(phase: Phase, message: String) -> LifecycleError {
    match phase {
        Phase::ApplicationStart => LifecycleError::ApplicationUnavailable(message),
        Phase::SessionStart => LifecycleError::SessionCreationFailed(message),
        Phase::SessionEnd | Phase::ApplicationEnd => {
            LifecycleError::TeardownFailure { phase, message }
        }
        Phase::Error => LifecycleError::ErrorHookFailure(message),
        Phase::RequestStart | Phase::Request | Phase::RequestEnd => {
            LifecycleError::HandlerFailure { phase, message }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}
