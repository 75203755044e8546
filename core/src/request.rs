//! Generic inbound request representation.
//!
//! The host process translates whatever it received on the wire into a
//! [`Request`] before handing it to the worker. Header names are stored
//! lowercased so lookups are case-insensitive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Descriptor of a file uploaded with the request.
///
/// The file content itself stays on disk at `temp_path`; the emission layer
/// owns its cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Form field the file was submitted under
    pub field: String,
    /// Original client-side file name
    pub file_name: String,
    /// MIME type reported by the client
    pub content_type: String,
    /// Size in bytes
    pub size: u64,
    /// Location of the temporary copy
    pub temp_path: PathBuf,
}

impl UploadedFile {
    /// Create a new upload descriptor.
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            size,
            temp_path: temp_path.into(),
        }
    }
}

/// Inbound request as seen by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: Value,
    files: Vec<UploadedFile>,
    server: BTreeMap<String, String>,
}

impl Request {
    /// Create a request with the given method and path.
    ///
    /// The method is normalized to upper case.
    #[must_use]
    pub fn new(method: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a header (name is lowercased).
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Add a cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Add a query string parameter.
    #[must_use]
    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set the parsed body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Attach an uploaded file descriptor.
    #[must_use]
    pub fn with_file(mut self, file: UploadedFile) -> Self {
        self.files.push(file);
        self
    }

    /// Add a server/environment parameter.
    #[must_use]
    pub fn with_server_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.server.insert(name.into(), value.into());
        self
    }

    /// Request method, upper case.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path, without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a header by (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, keyed by lowercased name.
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Look up a cookie by exact name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// All cookies.
    #[must_use]
    pub const fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    /// Look up a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// All query parameters.
    #[must_use]
    pub const fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Parsed body (`Value::Null` when the request had none).
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Uploaded file descriptors in submission order.
    #[must_use]
    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    /// Server/environment parameters.
    #[must_use]
    pub const fn server_params(&self) -> &BTreeMap<String, String> {
        &self.server
    }
}
