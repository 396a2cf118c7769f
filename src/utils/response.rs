//! Response handling utilities.
//!
//! [`BufferedResponse`] collects what the lifecycle callbacks write and is
//! rendered into an `http::Response` once the pipeline has finished.

use http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};

use crate::core::{CookieJar, ResponseSink};

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_HTML: &str = "text/html; charset=utf-8";
}

/// Cookie instruction queued for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    Set { name: String, value: String },
    Remove { name: String },
}

impl CookieChange {
    fn name(&self) -> &str {
        match self {
            CookieChange::Set { name, .. } | CookieChange::Remove { name } => name,
        }
    }

    /// Render as a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        match self {
            CookieChange::Set { name, value } => format!("{name}={value}; Path=/; HttpOnly"),
            CookieChange::Remove { name } => format!("{name}=; Path=/; Max-Age=0"),
        }
    }
}

/// In-memory [`ResponseSink`].
///
/// The first body write commits the response: later status, header, and
/// cookie changes are dropped, the way they would be once a streaming
/// transport has flushed its headers.
#[derive(Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<CookieChange>,
    body: Vec<u8>,
    committed: bool,
    ended: bool,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            committed: false,
            ended: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> &[CookieChange] {
        &self.cookies
    }

    /// Value of the last `Set` for `name`, if the cookie was not removed afterwards
    pub fn cookie(&self, name: &str) -> Option<&str> {
        match self.cookies.iter().rev().find(|c| c.name() == name)? {
            CookieChange::Set { value, .. } => Some(value),
            CookieChange::Remove { .. } => None,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Render the collected response for the HTTP transport
    pub fn into_http_response(self) -> Response<Vec<u8>> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;

        for cookie in &self.cookies {
            match HeaderValue::from_str(&cookie.to_header_value()) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => log::error!("Invalid cookie '{}': {e}", cookie.name()),
            }
        }

        response
    }

    fn writable_headers(&self, what: &str) -> bool {
        if self.committed {
            log::debug!("Response already committed, ignoring {what}");
        }
        !self.committed
    }

    fn queue_cookie(&mut self, change: CookieChange) {
        if self.writable_headers("cookie change") {
            self.cookies.retain(|c| c.name() != change.name());
            self.cookies.push(change);
        }
    }
}

impl CookieJar for BufferedResponse {
    fn set_cookie(&mut self, name: &str, value: &str) {
        self.queue_cookie(CookieChange::Set {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    fn remove_cookie(&mut self, name: &str) {
        self.queue_cookie(CookieChange::Remove {
            name: name.to_string(),
        });
    }
}

impl ResponseSink for BufferedResponse {
    fn set_status(&mut self, status: StatusCode) {
        if self.writable_headers("status change") {
            self.status = status;
        }
    }

    fn set_header(&mut self, name: &str, value: &str) {
        if !self.writable_headers("header change") {
            return;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => log::error!("Invalid response header '{name}: {value}'"),
        }
    }

    fn write(&mut self, chunk: &[u8]) {
        if self.ended {
            log::debug!("Response already ended, dropping {} bytes", chunk.len());
            return;
        }
        self.committed = true;
        self.body.extend_from_slice(chunk);
    }

    fn end(&mut self, chunk: Option<&[u8]>) {
        if let Some(chunk) = chunk {
            self.write(chunk);
        }
        self.committed = true;
        self.ended = true;
    }

    fn is_committed(&self) -> bool {
        self.committed
    }

    fn is_ended(&self) -> bool {
        self.ended
    }
}
