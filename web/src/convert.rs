//! Mapping between `http` messages and the worker's request/response types.

use crate::error::WebError;
use axum::body::Body;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use persistent_worker_core::request::Request;
use persistent_worker_core::response::WireResponse;
use serde_json::{Map, Value};

/// Split a `Cookie` header into name/value pairs.
///
/// Pairs without `=` or with an empty name are skipped; surrounding quotes
/// on values are removed.
#[must_use]
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// CGI-style server parameter name for a header (`x-api-key` → `HTTP_X_API_KEY`).
fn server_param_name(header: &HeaderName) -> String {
    format!("HTTP_{}", header.as_str().to_ascii_uppercase().replace('-', "_"))
}

fn parse_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, WebError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        Ok(serde_json::from_slice(body)?)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body).map_err(WebError::Form)?;
        Ok(Value::Object(
            pairs.into_iter().map(|(name, value)| (name, Value::String(value))).collect::<Map<_, _>>(),
        ))
    } else {
        Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
    }
}

/// Build the worker [`Request`] for an inbound HTTP request.
///
/// Headers with non-UTF-8 values are dropped. Every header is also exposed
/// as an `HTTP_*` server parameter, next to `REQUEST_METHOD`, `REQUEST_URI`
/// and `QUERY_STRING`.
///
/// # Errors
///
/// Returns [`WebError::Query`], [`WebError::Form`] or [`WebError::Json`]
/// when the query string or body cannot be decoded.
pub fn into_worker_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<Request, WebError> {
    let query = uri.query().unwrap_or_default();
    let mut request = Request::new(method.as_str(), uri.path())
        .with_server_param("REQUEST_METHOD", method.as_str())
        .with_server_param("REQUEST_URI", uri.to_string())
        .with_server_param("QUERY_STRING", query);

    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).map_err(WebError::Query)?;
    for (name, value) in pairs {
        request = request.with_query_param(name, value);
    }

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            tracing::debug!(header = %name, "Dropping non UTF-8 header");
            continue;
        };
        if name == header::COOKIE {
            for (cookie, cookie_value) in parse_cookie_header(value) {
                request = request.with_cookie(cookie, cookie_value);
            }
        }
        request = request
            .with_server_param(server_param_name(name), value)
            .with_header(name.as_str(), value);
    }

    Ok(request.with_body(parse_body(headers, body)?))
}

/// Turn a worker [`WireResponse`] into an axum response.
///
/// Header order is preserved and repeated headers such as `Set-Cookie`
/// are appended, not replaced.
///
/// # Errors
///
/// Returns [`WebError::InvalidStatus`] or [`WebError::InvalidHeader`] if
/// the worker produced something `http` cannot represent.
pub fn into_http_response(wire: WireResponse) -> Result<axum::response::Response, WebError> {
    let status = StatusCode::from_u16(wire.status).map_err(|_| WebError::InvalidStatus(wire.status))?;
    let mut response = axum::response::Response::new(Body::from(wire.body));
    *response.status_mut() = status;

    for (name, value) in wire.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| WebError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(&value).map_err(|_| WebError::InvalidHeader(name.clone()))?;
        response.headers_mut().append(header_name, header_value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("SESSIONID=abc123; theme=\"dark\"; broken; =empty");
        assert_eq!(
            cookies,
            vec![
                ("SESSIONID".to_string(), "abc123".to_string()),
                ("theme".to_string(), "dark".to_string()),
            ]
        );
    }

    #[test]
    fn test_into_worker_request_maps_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("SESSIONID=abc"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let uri: Uri = "/orders?page=2&sort=desc".parse().unwrap();

        let request = into_worker_request(&Method::POST, &uri, &headers, br#"{"id":7}"#).unwrap();

        assert_eq!(request.method(), "POST");
        assert_eq!(request.path(), "/orders");
        assert_eq!(request.query_param("page"), Some("2"));
        assert_eq!(request.cookie("SESSIONID"), Some("abc"));
        assert_eq!(request.header("Accept"), Some("application/json"));
        assert_eq!(request.body()["id"], 7);
        assert_eq!(request.server_params().get("HTTP_COOKIE").map(String::as_str), Some("SESSIONID=abc"));
        assert_eq!(request.server_params().get("REQUEST_URI").map(String::as_str), Some("/orders?page=2&sort=desc"));
    }

    #[test]
    fn test_form_body_becomes_object() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let uri: Uri = "/login".parse().unwrap();
        let request = into_worker_request(&Method::POST, &uri, &headers, b"user=alice&remember=1").unwrap();
        assert_eq!(request.body()["user"], "alice");
        assert_eq!(request.body()["remember"], "1");
    }

    #[test]
    fn test_invalid_json_body_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let uri: Uri = "/".parse().unwrap();
        let error = into_worker_request(&Method::POST, &uri, &headers, b"{").unwrap_err();
        assert!(matches!(error, WebError::Json(_)));
    }

    #[test]
    fn test_into_http_response_keeps_repeated_headers() {
        let wire = WireResponse {
            status: 201,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
            ],
            body: b"created".to_vec(),
        };
        let response = into_http_response(wire).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn test_into_http_response_rejects_bad_status() {
        let wire = WireResponse {
            status: 42,
            headers: Vec::new(),
            body: Vec::new(),
        };
        assert!(matches!(into_http_response(wire), Err(WebError::InvalidStatus(42))));
    }
}
