//! Sample application served by the binary.
//!
//! Counts page hits per session and greets from application scope.

use async_trait::async_trait;
use http::StatusCode;
use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    core::{
        ApplicationDescriptor, CallbackResult, DescriptorSettings, IncomingRequest,
        LifecycleError, RequestContext, ResponseSink, Signal,
    },
    scope::{ApplicationScope, SessionScope},
    utils::response::content_type,
};

pub const MESSAGE: &str = "ColdFusion FTW!!";

pub struct HitCounterApplication {
    settings: DescriptorSettings,
}

impl HitCounterApplication {
    pub fn new(settings: DescriptorSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ApplicationDescriptor for HitCounterApplication {
    fn settings(&self) -> &DescriptorSettings {
        &self.settings
    }

    async fn on_application_start(
        &self,
        application: &ApplicationScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        info!("[Application Start] {}", application.name());
        application.set("message", MESSAGE);
        Signal::Continue
    }

    async fn on_session_start(
        &self,
        _application: &ApplicationScope,
        session: &SessionScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        info!("[Session Start] {}", session.session_id());
        session.set("hitCount", 0);
        Ok(())
    }

    async fn on_request_start(
        &self,
        ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        info!("[Request Start] {} {}", ctx.request().method, ctx.request().path);
        if let Some(session) = ctx.session() {
            session.update("hitCount", |hits| {
                json!(hits.and_then(Value::as_i64).unwrap_or(0) + 1)
            });
        }
        Signal::Continue
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        info!("[Request] {}", ctx.request().id);

        let message = ctx
            .application()
            .get_as::<String>("message")
            .unwrap_or_default();

        response.set_header("Content-Type", content_type::TEXT_HTML);
        response.write_str("<h1>ColdFusion On Rust</h1>");
        response.write_str(&format!("<p>{message}</p>"));
        match ctx.session().and_then(|s| s.get_as::<i64>("hitCount")) {
            Some(hits) => {
                response.write_str(&format!("<p>Hello - this is page request {hits}.</p>"))
            }
            None => response.write_str("<p>Hello - sessions are off for this request.</p>"),
        }
        Ok(())
    }

    async fn on_request_end(
        &self,
        ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        info!("[Request End] {}", ctx.request().id);
        Ok(())
    }

    async fn on_session_end(
        &self,
        _application: &ApplicationScope,
        session: &SessionScope,
    ) -> CallbackResult {
        info!("[Session End] {}", session.session_id());
        Ok(())
    }

    async fn on_application_end(&self, application: &ApplicationScope) -> CallbackResult {
        info!("[Application End] {}", application.name());
        Ok(())
    }

    async fn on_error(
        &self,
        error: &LifecycleError,
        _request: Option<&IncomingRequest>,
        response: Option<&mut dyn ResponseSink>,
    ) -> CallbackResult {
        warn!("Uh oh! an error occurred: {error}");
        if let Some(response) = response {
            if !response.is_committed() {
                response.set_header("Content-Type", content_type::TEXT_PLAIN);
                let status = match error {
                    LifecycleError::ApplicationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    LifecycleError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                response.write_str(status.canonical_reason().unwrap_or("Error"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        core::ManualClock,
        pipeline::{RequestOutcome, RequestPipeline},
        utils::response::BufferedResponse,
    };

    fn pipeline(settings: DescriptorSettings) -> (Arc<ManualClock>, RequestPipeline) {
        let clock = Arc::new(ManualClock::new());
        let app = Arc::new(HitCounterApplication::new(settings));
        (clock.clone(), RequestPipeline::with_clock(app, clock))
    }

    async fn hit(pipeline: &RequestPipeline, token: Option<&str>) -> (Option<String>, String) {
        let mut request = IncomingRequest::new("/");
        if let Some(token) = token {
            request = request.with_session_token(token);
        }
        let mut response = BufferedResponse::new();
        let report = pipeline.run(request, &mut response).await;
        assert_eq!(report.outcome, RequestOutcome::Completed);
        assert_eq!(response.header("content-type"), Some(content_type::TEXT_HTML));
        (report.new_session, response.body_str())
    }

    #[tokio::test]
    async fn test_counts_hits_per_session() {
        let (_, pipeline) = pipeline(DescriptorSettings::default());

        let (token, body) = hit(&pipeline, None).await;
        assert!(body.contains(MESSAGE));
        assert!(body.contains("page request 1."));

        let token = token.unwrap();
        let (_, body) = hit(&pipeline, Some(token.as_str())).await;
        assert!(body.contains("page request 2."));

        // another browser gets its own count
        let (_, body) = hit(&pipeline, None).await;
        assert!(body.contains("page request 1."));
    }

    #[tokio::test]
    async fn test_count_restarts_after_session_timeout() {
        let (clock, pipeline) = pipeline(DescriptorSettings {
            session_timeout: Duration::from_secs(10),
            ..Default::default()
        });

        let (token, _) = hit(&pipeline, None).await;
        let token = token.unwrap();
        hit(&pipeline, Some(token.as_str())).await;

        clock.advance(Duration::from_secs(11));
        let (fresh, body) = hit(&pipeline, Some(token.as_str())).await;
        assert!(fresh.is_some());
        assert!(body.contains("page request 1."));
    }

    #[tokio::test]
    async fn test_without_sessions() {
        let (_, pipeline) = pipeline(DescriptorSettings {
            session_management: false,
            ..Default::default()
        });

        let (token, body) = hit(&pipeline, None).await;
        assert!(token.is_none());
        assert!(body.contains("sessions are off"));
    }

    #[tokio::test]
    async fn test_error_page_when_uncommitted() {
        let app = HitCounterApplication::new(DescriptorSettings::default());
        let mut response = BufferedResponse::new();

        let err = LifecycleError::RequestTimeout("slow".to_string());
        app.on_error(&err, None, Some(&mut response)).await.unwrap();

        assert_eq!(response.body_str(), "Gateway Timeout");
    }
}
