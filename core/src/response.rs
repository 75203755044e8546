//! Outbound response types.
//!
//! [`Response`] is what dispatchers and error renderers produce. At the end
//! of the request lifecycle it is converted into a [`WireResponse`], the flat
//! status/headers/body form a separate emission layer serializes.

use crate::request::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response body format negotiated for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseFormat {
    /// `text/html`
    #[default]
    Html,
    /// `application/json`
    Json,
    /// `text/plain`
    Plain,
}

impl ResponseFormat {
    /// `Content-Type` header value for this format.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Html => "text/html; charset=UTF-8",
            Self::Json => "application/json; charset=UTF-8",
            Self::Plain => "text/plain; charset=UTF-8",
        }
    }

    /// Pick a format from the request's `Accept` header.
    ///
    /// JSON wins whenever it is mentioned, then HTML, then plain text.
    /// Requests without a usable `Accept` header get HTML.
    #[must_use]
    pub fn negotiate(request: &Request) -> Self {
        let accept = request
            .header("accept")
            .unwrap_or_default()
            .to_ascii_lowercase();

        if accept.contains("application/json") {
            Self::Json
        } else if accept.contains("text/html") {
            Self::Html
        } else if accept.contains("text/plain") {
            Self::Plain
        } else {
            Self::Html
        }
    }
}

/// A cookie to be set on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// `Path` attribute
    pub path: Option<String>,
    /// `HttpOnly` attribute
    pub http_only: bool,
    /// `Secure` attribute
    pub secure: bool,
    /// `Max-Age` attribute in seconds
    pub max_age: Option<i64>,
}

impl Cookie {
    /// Create a session cookie with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            http_only: false,
            secure: false,
            max_age: None,
        }
    }

    /// Set the `Path` attribute.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Mark the cookie `HttpOnly`.
    #[must_use]
    pub const fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Mark the cookie `Secure`.
    #[must_use]
    pub const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Set the `Max-Age` attribute.
    #[must_use]
    pub const fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Render as a `Set-Cookie` header value.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut header = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            header.push_str("; Path=");
            header.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            header.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }
}

/// Response produced while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: String,
    format: ResponseFormat,
}

impl Response {
    /// Create an empty response with the given status.
    #[must_use]
    pub const fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: String::new(),
            format: ResponseFormat::Html,
        }
    }

    /// 200 response with an HTML body.
    #[must_use]
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200).with_body(body)
    }

    /// 200 response with a plain-text body.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_format(ResponseFormat::Plain)
            .with_body(body)
    }

    /// Response with a JSON body.
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status)
            .with_format(ResponseFormat::Json)
            .with_body(body.to_string())
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the body format.
    #[must_use]
    pub const fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a cookie.
    #[must_use]
    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Append a cookie in place.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// First header with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Cookies to be set.
    #[must_use]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Response body.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Body format.
    #[must_use]
    pub const fn format(&self) -> ResponseFormat {
        self.format
    }

    /// Convert into the wire-level representation.
    ///
    /// `leading_output` is raw output the handler emitted outside the
    /// response object; it is placed ahead of the body.
    #[must_use]
    pub fn into_wire(self, leading_output: &str) -> WireResponse {
        let mut headers = self.headers;
        if !headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case("content-type"))
        {
            headers.push((
                "Content-Type".to_string(),
                self.format.content_type().to_string(),
            ));
        }
        headers.extend(
            self.cookies
                .iter()
                .map(|cookie| ("Set-Cookie".to_string(), cookie.to_header_value())),
        );

        let mut body = Vec::with_capacity(leading_output.len() + self.body.len());
        body.extend_from_slice(leading_output.as_bytes());
        body.extend_from_slice(self.body.as_bytes());

        WireResponse {
            status: self.status,
            headers,
            body,
        }
    }
}

/// Flat response handed to the emission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status code
    pub status: u16,
    /// Headers in emission order; `Set-Cookie` may repeat
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl WireResponse {
    /// First header with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values of a header, in order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_negotiate_prefers_json() {
        let request = Request::new("GET", "/").with_header("Accept", "text/html, application/json");
        assert_eq!(ResponseFormat::negotiate(&request), ResponseFormat::Json);
    }

    #[test]
    fn test_negotiate_defaults_to_html() {
        assert_eq!(
            ResponseFormat::negotiate(&Request::new("GET", "/")),
            ResponseFormat::Html
        );
        let plain = Request::new("GET", "/").with_header("accept", "text/plain");
        assert_eq!(ResponseFormat::negotiate(&plain), ResponseFormat::Plain);
    }

    #[test]
    fn test_cookie_header_value() {
        let cookie = Cookie::new("SESSIONID", "abc").with_path("/").http_only();
        assert_eq!(cookie.to_header_value(), "SESSIONID=abc; Path=/; HttpOnly");
    }

    #[test]
    fn test_into_wire_adds_content_type_and_cookies() {
        let wire = Response::json(201, &json!({"id": 7}))
            .with_cookie(Cookie::new("a", "1"))
            .with_cookie(Cookie::new("b", "2"))
            .into_wire("");

        assert_eq!(wire.status, 201);
        assert_eq!(wire.header("content-type"), Some("application/json; charset=UTF-8"));
        assert_eq!(wire.header_values("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(wire.body_text(), r#"{"id":7}"#);
    }

    #[test]
    fn test_into_wire_keeps_explicit_content_type() {
        let wire = Response::ok("<svg/>")
            .with_header("Content-Type", "image/svg+xml")
            .into_wire("");
        assert_eq!(wire.header_values("content-type"), vec!["image/svg+xml"]);
    }

    #[test]
    fn test_into_wire_places_leading_output_first() {
        let wire = Response::text("body").into_wire("echoed ");
        assert_eq!(wire.body_text(), "echoed body");
    }
}
