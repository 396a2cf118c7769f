use http::HeaderMap;
use pingora_http::RequestHeader;

use crate::core::IncomingRequest;

/// Build the lifecycle view of a request received by the HTTP transport.
///
/// The session token is read from the cookie named `cookie_name`; an empty
/// cookie counts as no token.
pub fn incoming_request(req_header: &RequestHeader, cookie_name: &str) -> IncomingRequest {
    let mut request =
        IncomingRequest::new(req_header.uri.path()).with_method(req_header.method.clone());
    request.headers = req_header.headers.clone();

    if let Some(query) = req_header.uri.query() {
        request = request.with_query(query);
    }

    match get_cookie_value(&req_header.headers, cookie_name) {
        Some(token) if !token.is_empty() => request.with_session_token(token),
        _ => request,
    }
}

/// Retrieves the value of a specific header.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

/// Retrieves the value of a specific cookie from the `Cookie` header.
///
/// Parses simple `key=value` pairs only; quoted or encoded values are
/// returned as-is. Returns the first occurrence of the cookie's value.
pub fn get_cookie_value<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    let Some(cookie_header_value) = get_req_header_value(headers, "Cookie") else {
        log::debug!("No Cookie header found");
        return None;
    };

    for item in cookie_header_value.split(';') {
        if let Some((k, v)) = item.trim().split_once('=') {
            if k.trim() == cookie_name {
                return Some(v.trim());
            }
        }
    }
    log::debug!("Cookie '{cookie_name}' not found within Cookie header");

    None
}
