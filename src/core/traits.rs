//! Collaborator interfaces consumed by the lifecycle core
//!
//! The transport layer supplies implementations of these traits; the core
//! never touches sockets or cookie wire formats itself.

use http::StatusCode;

/// Cookie operations offered by the transport.
pub trait CookieJar: Send {
    /// Ask the client to store `name=value`
    fn set_cookie(&mut self, name: &str, value: &str);

    /// Ask the client to forget `name`
    fn remove_cookie(&mut self, name: &str);
}

/// Response being built for a single request.
///
/// Once a response is committed its status and headers can no longer change;
/// body writes after [`ResponseSink::end`] are dropped.
pub trait ResponseSink: CookieJar {
    fn set_status(&mut self, status: StatusCode);

    /// Set a header, replacing any previous value
    fn set_header(&mut self, name: &str, value: &str);

    /// Append a body chunk
    fn write(&mut self, chunk: &[u8]);

    /// Finish the response, optionally with a last chunk
    fn end(&mut self, chunk: Option<&[u8]>);

    /// `true` once headers have been sent
    fn is_committed(&self) -> bool;

    /// `true` once [`ResponseSink::end`] has been called
    fn is_ended(&self) -> bool;

    fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }
}
