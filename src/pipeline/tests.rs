use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use http::StatusCode;
use serde_json::{json, Value};

use super::*;
use crate::{
    core::{CallbackResult, DescriptorSettings, ErrorKind, ManualClock},
    utils::response::BufferedResponse,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Descriptor that records every callback and misbehaves on request
#[derive(Default)]
struct Script {
    settings: DescriptorSettings,
    events: Mutex<Vec<String>>,
    /// (kind, had a request, response committed)
    errors: Mutex<Vec<(ErrorKind, bool, Option<bool>)>>,
    fail_on: Option<Phase>,
    panic_on: Option<Phase>,
    abort_path: Option<&'static str>,
    handler_delay: Option<Duration>,
    write_before_fail: bool,
    decline_start: AtomicBool,
}

impl Script {
    fn with_settings(settings: DescriptorSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<(ErrorKind, bool, Option<bool>)> {
        self.errors.lock().unwrap().clone()
    }

    fn misbehave(&self, phase: Phase) -> CallbackResult {
        if self.panic_on == Some(phase) {
            panic!("{phase} exploded");
        }
        if self.fail_on == Some(phase) {
            return Err(format!("{phase} failed").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ApplicationDescriptor for Script {
    fn settings(&self) -> &DescriptorSettings {
        &self.settings
    }

    async fn on_application_start(
        &self,
        application: &ApplicationScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        self.record("application_start");
        if self.decline_start.load(Ordering::SeqCst) {
            return Signal::Abort;
        }
        application.set("message", "ColdFusion FTW!!");
        Signal::Continue
    }

    async fn on_session_start(
        &self,
        _application: &ApplicationScope,
        session: &SessionScope,
        _request: &IncomingRequest,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        self.record("session_start");
        self.misbehave(Phase::SessionStart)?;
        session.set("hitCount", 0);
        Ok(())
    }

    async fn on_request_start(
        &self,
        ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> Signal {
        self.record("request_start");
        if self.abort_path == Some(ctx.request().path.as_str()) {
            return Signal::Abort;
        }
        match self.misbehave(Phase::RequestStart) {
            Ok(()) => Signal::Continue,
            Err(e) => Signal::Fail(e),
        }
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        self.record("request");
        if let Some(delay) = self.handler_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(session) = ctx.session() {
            let hits = session.update("hitCount", |current| {
                json!(current.and_then(Value::as_i64).unwrap_or(0) + 1)
            });
            response.write_str(&format!("hits={hits}"));
        } else if self.write_before_fail {
            response.write_str("partial");
        }
        self.misbehave(Phase::Request)
    }

    async fn on_request_end(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut dyn ResponseSink,
    ) -> CallbackResult {
        self.record("request_end");
        self.misbehave(Phase::RequestEnd)
    }

    async fn on_session_end(
        &self,
        _application: &ApplicationScope,
        session: &SessionScope,
    ) -> CallbackResult {
        self.record(format!("session_end:{}", session.session_id()));
        Ok(())
    }

    async fn on_application_end(&self, _application: &ApplicationScope) -> CallbackResult {
        self.record("application_end");
        Ok(())
    }

    async fn on_error(
        &self,
        error: &LifecycleError,
        request: Option<&IncomingRequest>,
        response: Option<&mut dyn ResponseSink>,
    ) -> CallbackResult {
        self.errors.lock().unwrap().push((
            error.kind(),
            request.is_some(),
            response.map(|r| r.is_committed()),
        ));
        Ok(())
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    script: Arc<Script>,
    pipeline: RequestPipeline,
}

impl Harness {
    fn new(script: Script) -> Self {
        init_log();
        let clock = Arc::new(ManualClock::new());
        let script = Arc::new(script);
        let pipeline = RequestPipeline::with_clock(script.clone(), clock.clone());
        Self {
            clock,
            script,
            pipeline,
        }
    }

    async fn request(&self, token: Option<&str>) -> (RequestReport, BufferedResponse) {
        let mut request = IncomingRequest::new("/index.cfm");
        if let Some(token) = token {
            request = request.with_session_token(token);
        }
        self.send(request).await
    }

    async fn send(&self, request: IncomingRequest) -> (RequestReport, BufferedResponse) {
        let mut response = BufferedResponse::new();
        let report = self.pipeline.run(request, &mut response).await;
        (report, response)
    }
}

fn five_second_sessions() -> DescriptorSettings {
    DescriptorSettings {
        name: "Test".to_string(),
        session_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_happy_path_states_and_cookie() {
    let h = Harness::new(Script::with_settings(five_second_sessions()));

    let (report, response) = h.request(None).await;

    assert_eq!(report.outcome, RequestOutcome::Completed);
    assert_eq!(
        report.states,
        vec![
            PipelineState::Created,
            PipelineState::Acquiring,
            PipelineState::Starting,
            PipelineState::Handling,
            PipelineState::Ending,
            PipelineState::Completed,
        ]
    );
    let token = report.new_session.expect("a session was created");
    assert_eq!(response.cookie("CFID"), Some(token.as_str()));
    assert!(response.is_ended());
    assert_eq!(response.body_str(), "hits=1");
    assert_eq!(
        h.script.events(),
        vec![
            "application_start",
            "session_start",
            "request_start",
            "request",
            "request_end"
        ]
    );

    // a resumed session sets no cookie
    let (report, response) = h.request(Some(token.as_str())).await;
    assert!(report.new_session.is_none());
    assert!(response.cookies().is_empty());
    assert_eq!(response.body_str(), "hits=2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hits_are_all_counted() {
    init_log();
    let script = Arc::new(Script::with_settings(five_second_sessions()));
    let pipeline = Arc::new(RequestPipeline::with_clock(
        script,
        Arc::new(ManualClock::new()),
    ));

    let mut response = BufferedResponse::new();
    let first = pipeline.run(IncomingRequest::new("/"), &mut response).await;
    let token = first.new_session.unwrap();

    let hits = 50;
    let handles = (0..hits).map(|_| {
        let pipeline = pipeline.clone();
        let request = IncomingRequest::new("/").with_session_token(token.as_str());
        tokio::spawn(async move {
            let mut response = BufferedResponse::new();
            pipeline.run(request, &mut response).await
        })
    });
    let reports = join_all(handles).await;
    assert!(reports
        .iter()
        .all(|report| report.as_ref().unwrap().outcome == RequestOutcome::Completed));

    let session = pipeline.sessions().get(&token).unwrap();
    assert_eq!(session.get_as::<i64>("hitCount"), Some(hits + 1));
    assert_eq!(pipeline.sessions().live_count(), 1);
}

#[tokio::test]
async fn test_session_expires_after_idle_timeout() {
    let h = Harness::new(Script::with_settings(five_second_sessions()));

    let (first, _) = h.request(None).await;
    let token = first.new_session.unwrap();

    h.clock.advance(Duration::from_secs(3));
    let (second, response) = h.request(Some(token.as_str())).await;
    assert!(second.new_session.is_none());
    assert_eq!(response.body_str(), "hits=2");

    // idle for 6s since the last access
    h.clock.advance(Duration::from_secs(6));
    let (third, response) = h.request(Some(token.as_str())).await;
    let replacement = third.new_session.unwrap();
    assert_ne!(replacement, token);
    assert_eq!(response.body_str(), "hits=1");
    assert_eq!(response.cookie("CFID"), Some(replacement.as_str()));

    let events = h.script.events();
    let ended = events
        .iter()
        .position(|e| *e == format!("session_end:{token}"))
        .expect("old session ended");
    let restarted = events
        .iter()
        .rposition(|e| e == "session_start")
        .unwrap();
    assert!(ended < restarted);
}

#[tokio::test]
async fn test_application_expires_after_idle_timeout() {
    let h = Harness::new(Script::with_settings(DescriptorSettings {
        application_timeout: Duration::from_secs(300),
        ..Default::default()
    }));

    let (first, _) = h.request(None).await;
    let app = h.pipeline.applications().current().unwrap();
    assert_eq!(
        app.get_as::<String>("message").as_deref(),
        Some("ColdFusion FTW!!")
    );

    h.clock.advance(Duration::from_secs(299));
    h.request(first.new_session.as_deref()).await;
    assert_eq!(h.pipeline.sweep().await.total(), 0);

    h.clock.advance(Duration::from_secs(300));
    let report = h.pipeline.sweep().await;
    assert_eq!(report.sessions, 0);
    assert_eq!(report.applications, 1);
    assert!(h.pipeline.applications().current().is_none());

    let events = h.script.events();
    let app_end = events.iter().position(|e| e == "application_end").unwrap();
    let session_end = events
        .iter()
        .position(|e| e.starts_with("session_end:"))
        .unwrap();
    assert!(session_end < app_end);

    // the next request starts a fresh application and session
    let (next, _) = h.request(first.new_session.as_deref()).await;
    assert!(next.new_session.is_some());
    let starts = h
        .script
        .events()
        .iter()
        .filter(|e| *e == "application_start")
        .count();
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn test_request_end_runs_after_handler_failure() {
    let h = Harness::new(Script {
        fail_on: Some(Phase::Request),
        ..Default::default()
    });

    let (report, response) = h.request(None).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => {
            assert_eq!(e.kind(), ErrorKind::HandlerFailure);
            assert_eq!(e.phase(), Some(Phase::Request));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(report.states.contains(&PipelineState::Failed));
    assert_eq!(report.states.last(), Some(&PipelineState::Completed));
    assert!(h
        .script
        .events()
        .ends_with(&["request".to_string(), "request_end".to_string()]));
    // the handler wrote before failing, so the status could not change
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.script.errors(),
        vec![(ErrorKind::HandlerFailure, true, Some(true))]
    );
}

#[tokio::test]
async fn test_failure_before_commit_sets_status() {
    let h = Harness::new(Script {
        settings: DescriptorSettings {
            session_management: false,
            ..Default::default()
        },
        fail_on: Some(Phase::RequestStart),
        ..Default::default()
    });

    let (report, response) = h.request(None).await;

    assert!(matches!(report.outcome, RequestOutcome::Failed(_)));
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.is_ended());
    assert!(!h.script.events().contains(&"request".to_string()));
    assert!(h.script.events().contains(&"request_end".to_string()));
    assert_eq!(
        h.script.errors(),
        vec![(ErrorKind::HandlerFailure, true, Some(false))]
    );
}

#[tokio::test]
async fn test_committed_failure_keeps_status() {
    let h = Harness::new(Script {
        settings: DescriptorSettings {
            session_management: false,
            ..Default::default()
        },
        fail_on: Some(Phase::Request),
        write_before_fail: true,
        ..Default::default()
    });

    let (_, response) = h.request(None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body_str(), "partial");
    assert_eq!(
        h.script.errors(),
        vec![(ErrorKind::HandlerFailure, true, Some(true))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_routes_once() {
    let h = Harness::new(Script {
        settings: DescriptorSettings {
            request_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
        handler_delay: Some(Duration::from_secs(10)),
        ..Default::default()
    });

    let (report, response) = h.request(None).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::RequestTimeout),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(response.is_ended());
    assert_eq!(
        h.script.errors(),
        vec![(ErrorKind::RequestTimeout, true, Some(false))]
    );
    assert!(h.script.events().contains(&"request_end".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_fast_request_beats_timeout() {
    let h = Harness::new(Script {
        settings: DescriptorSettings {
            request_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        },
        handler_delay: Some(Duration::from_millis(10)),
        ..Default::default()
    });

    let (report, _) = h.request(None).await;
    assert_eq!(report.outcome, RequestOutcome::Completed);
    assert!(h.script.errors().is_empty());
}

#[tokio::test]
async fn test_abort_short_circuits_without_error() {
    let h = Harness::new(Script {
        abort_path: Some("/blocked"),
        ..Default::default()
    });

    let (report, response) = h.send(IncomingRequest::new("/blocked")).await;

    assert_eq!(report.outcome, RequestOutcome::Aborted);
    assert_eq!(
        report.states,
        vec![
            PipelineState::Created,
            PipelineState::Acquiring,
            PipelineState::Starting,
            PipelineState::Ending,
            PipelineState::Completed,
        ]
    );
    assert!(response.is_ended());
    assert!(h.script.errors().is_empty());
    // only onRequest is skipped
    assert_eq!(
        h.script.events(),
        vec![
            "application_start",
            "session_start",
            "request_start",
            "request_end"
        ]
    );
}

#[tokio::test]
async fn test_abort_then_failing_request_end() {
    let h = Harness::new(Script {
        abort_path: Some("/blocked"),
        fail_on: Some(Phase::RequestEnd),
        ..Default::default()
    });

    let (report, response) = h.send(IncomingRequest::new("/blocked")).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::HandlerFailure),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.script.errors().len(), 1);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let h = Harness::new(Script {
        panic_on: Some(Phase::Request),
        ..Default::default()
    });

    let (report, response) = h.request(None).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => assert!(e.message().contains("exploded")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(response.is_ended());
    assert!(h.script.events().contains(&"request_end".to_string()));

    // the engine keeps serving
    let (again, _) = h.request(None).await;
    assert!(matches!(again.outcome, RequestOutcome::Failed(_)));
    assert_eq!(h.pipeline.applications().live_count(), 1);
}

#[tokio::test]
async fn test_declined_application_start() {
    let h = Harness::new(Script::default());
    h.script.decline_start.store(true, Ordering::SeqCst);

    let (report, response) = h.request(None).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::ApplicationUnavailable),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        report.states,
        vec![
            PipelineState::Created,
            PipelineState::Acquiring,
            PipelineState::Failed,
            PipelineState::Completed,
        ]
    );
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.pipeline.applications().current().is_none());
    assert_eq!(h.script.events(), vec!["application_start"]);

    // the next request retries
    h.script.decline_start.store(false, Ordering::SeqCst);
    let (report, _) = h.request(None).await;
    assert_eq!(report.outcome, RequestOutcome::Completed);
}

#[tokio::test]
async fn test_failed_session_start_leaves_no_session() {
    let h = Harness::new(Script {
        fail_on: Some(Phase::SessionStart),
        ..Default::default()
    });

    let (report, response) = h.request(None).await;

    match &report.outcome {
        RequestOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::SessionCreationFailed),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(report.new_session.is_none());
    assert!(response.cookies().is_empty());
    assert_eq!(h.pipeline.sessions().live_count(), 0);
    assert!(!h.script.events().contains(&"request".to_string()));
}

#[tokio::test]
async fn test_session_management_disabled() {
    let h = Harness::new(Script::with_settings(DescriptorSettings {
        session_management: false,
        ..Default::default()
    }));

    let (report, response) = h.request(Some("ignored")).await;

    assert_eq!(report.outcome, RequestOutcome::Completed);
    assert!(report.new_session.is_none());
    assert!(response.cookies().is_empty());
    assert_eq!(h.pipeline.sessions().live_count(), 0);
    assert!(!h.script.events().contains(&"session_start".to_string()));
}

#[tokio::test]
async fn test_client_cookies_can_be_disabled() {
    let h = Harness::new(Script::with_settings(DescriptorSettings {
        set_client_cookies: false,
        ..Default::default()
    }));

    let (report, response) = h.request(None).await;

    assert!(report.new_session.is_some());
    assert!(response.cookies().is_empty());
}

#[tokio::test]
async fn test_shutdown_ends_everything() {
    let h = Harness::new(Script::default());
    h.request(None).await;
    h.request(None).await;

    let report = h.pipeline.shutdown().await;

    assert_eq!(report.sessions, 2);
    assert_eq!(report.applications, 1);
    assert_eq!(h.pipeline.sessions().live_count(), 0);
    assert!(h.pipeline.applications().current().is_none());
    assert_eq!(
        h.script.events().last().map(String::as_str),
        Some("application_end")
    );
}
