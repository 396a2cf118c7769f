//! Request pipeline
//!
//! [`RequestPipeline`] drives one request through the descriptor callbacks:
//! acquire the application and session scopes, `onRequestStart`, `onRequest`,
//! `onRequestEnd`, release. Failures at any step go through the
//! [`ErrorRouter`]; the pipeline always leaves exactly one ended response.

pub mod error_router;

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc, time::Duration};

use http::StatusCode;
use log::{debug, info, warn};

pub use error_router::ErrorRouter;

use crate::{
    core::{
        ApplicationDescriptor, Clock, IncomingRequest, LifecycleError, LifecycleResult, Phase,
        RequestContext, ResponseSink, Signal, SystemClock,
    },
    registry::{ApplicationRegistry, SessionRegistry, SweepReport},
    scope::{ApplicationScope, SessionScope},
};

/// States a request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Acquiring,
    Starting,
    Handling,
    Ending,
    Failed,
    Completed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a request finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Every step ran without failure
    Completed,
    /// `onRequestStart` short-circuited the request on purpose
    Aborted,
    /// A failure was routed to the error hook
    Failed(LifecycleError),
}

/// Summary of one pipeline run, handed back to the transport.
#[derive(Debug, Clone)]
pub struct RequestReport {
    pub request_id: String,
    pub outcome: RequestOutcome,
    /// Every state the request passed through, in order
    pub states: Vec<PipelineState>,
    /// Token of a session created by this request
    pub new_session: Option<String>,
}

/// Per-request state machine bookkeeping
struct Run {
    request_id: String,
    states: Vec<PipelineState>,
}

impl Run {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            states: vec![PipelineState::Created],
        }
    }

    fn state(&self) -> PipelineState {
        self.states
            .last()
            .copied()
            .unwrap_or(PipelineState::Created)
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Request {}: {} -> {next}", self.request_id, self.state());
        self.states.push(next);
    }
}

/// Result of the time-bounded start and handle steps
enum Flow {
    Handled,
    Aborted,
}

/// Orchestrates requests for one application descriptor.
///
/// The pipeline owns both registries; expiry sweeps and shutdown go through
/// it as well so that teardown failures reach the same error hook.
pub struct RequestPipeline {
    descriptor: Arc<dyn ApplicationDescriptor>,
    router: Arc<ErrorRouter>,
    applications: Arc<ApplicationRegistry>,
    sessions: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
}

impl RequestPipeline {
    pub fn new(descriptor: Arc<dyn ApplicationDescriptor>) -> Self {
        Self::with_clock(descriptor, Arc::new(SystemClock))
    }

    /// Create a pipeline whose idle timeouts are measured with `clock`
    pub fn with_clock(descriptor: Arc<dyn ApplicationDescriptor>, clock: Arc<dyn Clock>) -> Self {
        let router = Arc::new(ErrorRouter::new(descriptor.clone()));
        let sessions = Arc::new(SessionRegistry::new(
            descriptor.clone(),
            router.clone(),
            clock.clone(),
        ));
        let applications = Arc::new(ApplicationRegistry::new(
            descriptor.clone(),
            router.clone(),
            sessions.clone(),
            clock.clone(),
        ));

        Self {
            descriptor,
            router,
            applications,
            sessions,
            clock,
        }
    }

    pub fn descriptor(&self) -> &Arc<dyn ApplicationDescriptor> {
        &self.descriptor
    }

    pub fn applications(&self) -> &ApplicationRegistry {
        &self.applications
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Run one request to completion.
    ///
    /// Never fails: every failure is routed to the descriptor's error hook
    /// and reported in [`RequestReport::outcome`]. The response is ended
    /// before this returns.
    pub async fn run(
        &self,
        request: IncomingRequest,
        response: &mut dyn ResponseSink,
    ) -> RequestReport {
        let mut run = Run::new(&request.id);

        run.transition(PipelineState::Acquiring);
        let (application, session, new_session) = match self.acquire(&request, response).await {
            Ok(acquired) => acquired,
            Err(e) => {
                let outcome = self.fail(&mut run, e, &request, response).await;
                return self.release(run, outcome, None, response);
            }
        };

        let settings = self.descriptor.settings();
        let deadline = settings
            .request_timeout
            .map(|timeout| self.clock.now() + timeout);
        let mut ctx = RequestContext::new(request, application, session, deadline);

        run.transition(PipelineState::Starting);
        let flow = match settings.request_timeout {
            Some(limit) => {
                let bounded = self.start_and_handle(&mut run, &mut ctx, response);
                match tokio::time::timeout(limit, bounded).await {
                    Ok(flow) => flow,
                    Err(_) => Err(timed_out(limit)),
                }
            }
            None => self.start_and_handle(&mut run, &mut ctx, response).await,
        };
        ctx.observe_commit(response.is_committed());
        if let (Ok(_), Some(left)) = (&flow, ctx.remaining(self.clock.now())) {
            debug!(
                "Request {} handled with {}ms of its timeout left",
                run.request_id,
                left.as_millis()
            );
        }

        let outcome = match flow {
            Ok(flow) => {
                if let Flow::Aborted = flow {
                    info!("Request {} aborted by {}", run.request_id, Phase::RequestStart);
                }
                run.transition(PipelineState::Ending);
                match (self.end_request(&mut ctx, response).await, flow) {
                    (Ok(()), Flow::Handled) => RequestOutcome::Completed,
                    (Ok(()), Flow::Aborted) => RequestOutcome::Aborted,
                    (Err(e), _) => self.fail(&mut run, e, ctx.request(), response).await,
                }
            }
            Err(e) => {
                run.transition(PipelineState::Failed);
                // onRequestEnd still runs once the scopes were acquired
                if let Err(end_failure) = self.end_request(&mut ctx, response).await {
                    self.route(&end_failure, ctx.request(), response).await;
                }
                self.route(&e, ctx.request(), response).await;
                RequestOutcome::Failed(e)
            }
        };
        ctx.observe_commit(response.is_committed());

        self.release(run, outcome, new_session, response)
    }

    /// Resolve the application and, when enabled, the session scope
    async fn acquire(
        &self,
        request: &IncomingRequest,
        response: &mut dyn ResponseSink,
    ) -> LifecycleResult<(Arc<ApplicationScope>, Option<Arc<SessionScope>>, Option<String>)>
    {
        let descriptor = &self.descriptor;
        let router = &self.router;

        let sink = &mut *response;
        let application = self
            .applications
            .get_or_create(move |scope| async move {
                let start = descriptor.on_application_start(&scope, request, sink);
                router.guard_signal(Phase::ApplicationStart, start).await
            })
            .await?;

        if !descriptor.session_management(request) {
            debug!("Session management disabled for request {}", request.id);
            return Ok((application, None, None));
        }

        let sink = &mut *response;
        let owner = &application;
        let resolved = self
            .sessions
            .resolve(
                &application,
                request.session_token.as_deref(),
                move |scope| async move {
                    let start = descriptor.on_session_start(owner, &scope, request, sink);
                    router.guard(Phase::SessionStart, start).await
                },
            )
            .await?;

        let mut new_session = None;
        if resolved.created {
            let token = resolved.scope.session_id().to_string();
            let settings = descriptor.settings();
            if settings.set_client_cookies {
                response.set_cookie(&settings.session_cookie_name, &token);
            }
            new_session = Some(token);
        }

        Ok((application, Some(resolved.scope), new_session))
    }

    /// `onRequestStart` then `onRequest`; the part bounded by the request timeout
    async fn start_and_handle(
        &self,
        run: &mut Run,
        ctx: &mut RequestContext,
        response: &mut dyn ResponseSink,
    ) -> LifecycleResult<Flow> {
        let start = self.descriptor.on_request_start(ctx, response);
        match self.router.guard_signal(Phase::RequestStart, start).await {
            Signal::Continue => {}
            Signal::Abort => return Ok(Flow::Aborted),
            Signal::Fail(e) => {
                return Err(LifecycleError::HandlerFailure {
                    phase: Phase::RequestStart,
                    message: e.to_string(),
                })
            }
        }
        ctx.observe_commit(response.is_committed());

        run.transition(PipelineState::Handling);
        let handle = self.descriptor.on_request(ctx, response);
        self.router.guard(Phase::Request, handle).await?;

        Ok(Flow::Handled)
    }

    async fn end_request(
        &self,
        ctx: &mut RequestContext,
        response: &mut dyn ResponseSink,
    ) -> LifecycleResult<()> {
        let end = self.descriptor.on_request_end(ctx, response);
        self.router.guard(Phase::RequestEnd, end).await
    }

    /// Move to `Failed` and route `error`
    async fn fail(
        &self,
        run: &mut Run,
        error: LifecycleError,
        request: &IncomingRequest,
        response: &mut dyn ResponseSink,
    ) -> RequestOutcome {
        run.transition(PipelineState::Failed);
        self.route(&error, request, response).await;
        RequestOutcome::Failed(error)
    }

    /// Route a failure that happened while serving `request`
    async fn route(
        &self,
        error: &LifecycleError,
        request: &IncomingRequest,
        response: &mut dyn ResponseSink,
    ) {
        if !response.is_committed() {
            response.set_status(status_for(error));
        }
        self.router.route(error, Some(request), Some(response)).await;
    }

    /// End the response if nobody did and build the report
    fn release(
        &self,
        mut run: Run,
        outcome: RequestOutcome,
        new_session: Option<String>,
        response: &mut dyn ResponseSink,
    ) -> RequestReport {
        if !response.is_ended() {
            response.end(None);
        }
        run.transition(PipelineState::Completed);

        RequestReport {
            request_id: run.request_id,
            outcome,
            states: run.states,
            new_session,
        }
    }

    /// Tear down every scope that has idled past its timeout.
    ///
    /// Sessions are swept before the application so that a session ended by
    /// its own timeout is not ended again as part of its application.
    pub async fn sweep(&self) -> SweepReport {
        let sessions = self.sessions.sweep().await;
        let applications = self.applications.sweep().await;
        SweepReport {
            sessions,
            applications,
        }
    }

    /// Tear down every live scope, sessions first
    pub async fn shutdown(&self) -> SweepReport {
        let sessions = self.sessions.end_all().await;
        let applications = self.applications.end_all().await;
        info!("Lifecycle shut down: {sessions} session(s), {applications} application(s) ended");
        SweepReport {
            sessions,
            applications,
        }
    }
}

fn timed_out(limit: Duration) -> LifecycleError {
    warn!("Request exceeded its {}ms timeout", limit.as_millis());
    LifecycleError::RequestTimeout(format!(
        "request did not finish within {}ms",
        limit.as_millis()
    ))
}

/// Status written for a failure when the response is still open
fn status_for(error: &LifecycleError) -> StatusCode {
    match error {
        LifecycleError::ApplicationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
