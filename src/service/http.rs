use std::sync::Arc;

use async_trait::async_trait;
use http::Response;
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};

use crate::{
    core::IncomingRequest,
    pipeline::{RequestOutcome, RequestPipeline},
    utils::{request::incoming_request, response::BufferedResponse},
};

/// HTTP application serving one application descriptor.
///
/// Each request is run through the lifecycle pipeline against a buffered
/// response, which is sent once the pipeline has released it.
pub struct DescriptorHttpApp {
    pipeline: Arc<RequestPipeline>,
}

impl DescriptorHttpApp {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    /// Listening service for the application; listeners are added by the caller
    pub fn descriptor_http_service(pipeline: Arc<RequestPipeline>) -> Service<Self> {
        let name = format!("{} HTTP", pipeline.descriptor().settings().name);
        Service::new(name, Self::new(pipeline))
    }

    /// Name of the cookie carrying the session token
    pub fn session_cookie_name(&self) -> &str {
        &self.pipeline.descriptor().settings().session_cookie_name
    }

    pub async fn handle(&self, request: IncomingRequest) -> Response<Vec<u8>> {
        let method = request.method.clone();
        let path = request.path.clone();

        let mut response = BufferedResponse::new();
        let report = self.pipeline.run(request, &mut response).await;

        let rendered = response.into_http_response();
        match &report.outcome {
            RequestOutcome::Failed(e) => log::warn!(
                "{method} {path} -> {} ({}): {e}",
                rendered.status().as_u16(),
                report.request_id
            ),
            _ => log::info!(
                "{method} {path} -> {} ({})",
                rendered.status().as_u16(),
                report.request_id
            ),
        }
        rendered
    }
}

#[async_trait]
impl ServeHttp for DescriptorHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let request = incoming_request(http_session.req_header(), self.session_cookie_name());
        self.handle(request).await
    }
}
