//! Per-request context handed to the dispatcher.
//!
//! Request-local state that a request-per-process runtime would keep in
//! globals or class-level statics lives here instead: the output buffer
//! stack, the uploaded-file cache, the route-resolution state and the
//! buffered application log. The worker clears each of them explicitly at
//! the appropriate lifecycle step.

use crate::component::{Component, ComponentSet};
use crate::event_bus::EventBus;
use crate::request::{Request, UploadedFile};
use crate::response::ResponseFormat;
use crate::session::SessionStore;
use std::collections::BTreeMap;

/// Stack of output buffers.
///
/// Level 0 means unbuffered: writes go straight to the emitted output.
/// Each [`OutputBuffer::start`] pushes a new level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    emitted: String,
    levels: Vec<String>,
}

impl OutputBuffer {
    /// Unbuffered output.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            emitted: String::new(),
            levels: Vec::new(),
        }
    }

    /// Push a buffering level.
    pub fn start(&mut self) {
        self.levels.push(String::new());
    }

    /// Current nesting level.
    #[must_use]
    pub fn level(&self) -> usize {
        self.levels.len()
    }

    /// Write into the innermost buffer (or emit directly at level 0).
    pub fn write(&mut self, text: &str) {
        match self.levels.last_mut() {
            Some(buffer) => buffer.push_str(text),
            None => self.emitted.push_str(text),
        }
    }

    /// Pop the innermost level, passing its content to the level below.
    ///
    /// Returns `false` at level 0.
    pub fn end_flush(&mut self) -> bool {
        match self.levels.pop() {
            Some(content) => {
                self.write(&content);
                true
            }
            None => false,
        }
    }

    /// Drop buffered content until only `min_level` levels remain.
    ///
    /// Returns how many bytes were discarded.
    pub fn discard_to(&mut self, min_level: usize) -> usize {
        let mut discarded = 0;
        while self.levels.len() > min_level {
            discarded += self.levels.pop().map_or(0, |content| content.len());
        }
        discarded
    }

    /// Flush every level and take everything emitted so far.
    pub fn take_all(&mut self) -> String {
        while self.end_flush() {}
        std::mem::take(&mut self.emitted)
    }
}

/// Lazily indexed uploaded files for the current request.
///
/// Owned by the worker so the index survives only until it is explicitly
/// reset at the end of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadCache {
    by_field: Option<BTreeMap<String, Vec<UploadedFile>>>,
}

impl UploadCache {
    /// Empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self { by_field: None }
    }

    /// All files uploaded under `field`.
    pub fn instances(&mut self, request: &Request, field: &str) -> &[UploadedFile] {
        let index = self.by_field.get_or_insert_with(|| {
            let mut index: BTreeMap<String, Vec<UploadedFile>> = BTreeMap::new();
            for file in request.files() {
                index.entry(file.field.clone()).or_default().push(file.clone());
            }
            index
        });
        index.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    /// First file uploaded under `field`.
    pub fn instance(&mut self, request: &Request, field: &str) -> Option<&UploadedFile> {
        self.instances(request, field).first()
    }

    /// Whether the index has been built.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.by_field.is_some()
    }

    /// Forget the index.
    pub fn reset(&mut self) {
        self.by_field = None;
    }
}

/// Route resolution state of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteState {
    /// Route requested by the client
    pub requested_route: String,
    /// Action the route resolved to
    pub requested_action: Option<String>,
    /// Parameters extracted while resolving
    pub requested_params: BTreeMap<String, String>,
}

impl RouteState {
    /// Clear all resolution results.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether nothing has been resolved.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

/// Severity of a buffered log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors
    Error,
    /// Warnings
    Warning,
    /// Informational
    Info,
    /// Debug tracing
    Trace,
}

/// One buffered log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Severity
    pub level: LogLevel,
    /// Category (usually the emitting component)
    pub category: String,
    /// Message
    pub message: String,
}

/// Application log buffered for the duration of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLog {
    entries: Vec<LogEntry>,
}

impl RequestLog {
    /// Empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Buffer an entry.
    pub fn push(&mut self, level: LogLevel, category: impl Into<String>, message: impl Into<String>) {
        self.entries.push(LogEntry {
            level,
            category: category.into(),
            message: message.into(),
        });
    }

    /// Take every buffered entry.
    pub fn drain(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request-local state borrowed from the worker for one dispatch.
#[derive(Debug)]
pub struct RequestScope<'w> {
    /// Uploaded-file index
    pub uploads: &'w mut UploadCache,
    /// Route resolution state
    pub route: &'w mut RouteState,
    /// Output buffer stack
    pub output: &'w mut OutputBuffer,
    /// Buffered application log
    pub log: &'w mut RequestLog,
}

/// Everything a dispatcher may touch while handling one request.
pub struct RequestContext<'w> {
    request: &'w Request,
    components: &'w ComponentSet,
    session: &'w mut dyn SessionStore,
    bus: &'w dyn EventBus,
    scope: RequestScope<'w>,
    format: ResponseFormat,
}

impl<'w> RequestContext<'w> {
    /// Assemble a context.
    #[must_use]
    pub fn new(
        request: &'w Request,
        components: &'w ComponentSet,
        session: &'w mut dyn SessionStore,
        bus: &'w dyn EventBus,
        scope: RequestScope<'w>,
        format: ResponseFormat,
    ) -> Self {
        Self {
            request,
            components,
            session,
            bus,
            scope,
            format,
        }
    }

    /// The inbound request.
    #[must_use]
    pub const fn request(&self) -> &'w Request {
        self.request
    }

    /// Live components.
    #[must_use]
    pub const fn components(&self) -> &'w ComponentSet {
        self.components
    }

    /// Typed component lookup.
    #[must_use]
    pub fn component<T: Component>(&self, id: &str) -> Option<&'w T> {
        self.components.get_as::<T>(id)
    }

    /// The bound session.
    #[must_use]
    pub fn session(&self) -> &dyn SessionStore {
        &*self.session
    }

    /// The bound session, mutably.
    pub fn session_mut(&mut self) -> &mut dyn SessionStore {
        &mut *self.session
    }

    /// The worker's event bus.
    #[must_use]
    pub const fn bus(&self) -> &'w dyn EventBus {
        self.bus
    }

    /// First file uploaded under `field`.
    pub fn upload(&mut self, field: &str) -> Option<&UploadedFile> {
        self.scope.uploads.instance(self.request, field)
    }

    /// All files uploaded under `field`.
    pub fn uploads(&mut self, field: &str) -> &[UploadedFile] {
        self.scope.uploads.instances(self.request, field)
    }

    /// Route resolution state.
    pub fn route_mut(&mut self) -> &mut RouteState {
        &mut *self.scope.route
    }

    /// Output buffer stack.
    pub fn output_mut(&mut self) -> &mut OutputBuffer {
        &mut *self.scope.output
    }

    /// Write raw output.
    pub fn echo(&mut self, text: &str) {
        self.scope.output.write(text);
    }

    /// Buffer a log entry; flushed when the request finalizes.
    pub fn log(&mut self, level: LogLevel, category: impl Into<String>, message: impl Into<String>) {
        self.scope.log.push(level, category, message);
    }

    /// Negotiated response format.
    #[must_use]
    pub const fn format(&self) -> ResponseFormat {
        self.format
    }

    /// Override the response format (used for error rendering).
    pub fn set_format(&mut self, format: ResponseFormat) {
        self.format = format;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_levels_flush_into_parent() {
        let mut output = OutputBuffer::new();
        output.start();
        output.write("outer ");
        output.start();
        output.write("inner");
        assert_eq!(output.level(), 2);

        assert!(output.end_flush());
        assert_eq!(output.level(), 1);
        assert_eq!(output.take_all(), "outer inner");
        assert_eq!(output.level(), 0);
    }

    #[test]
    fn test_discard_respects_min_level() {
        let mut output = OutputBuffer::new();
        output.write("sent ");
        output.start();
        output.write("harness");
        output.start();
        output.write("handler");

        assert_eq!(output.discard_to(1), "handler".len());
        assert_eq!(output.level(), 1);
        assert_eq!(output.take_all(), "sent harness");
    }

    #[test]
    fn test_discard_to_zero_keeps_emitted_output() {
        let mut output = OutputBuffer::new();
        output.write("sent");
        output.start();
        output.write("buffered");

        output.discard_to(0);
        assert_eq!(output.take_all(), "sent");
    }

    #[test]
    fn test_upload_cache_indexes_lazily_and_resets() {
        let request = Request::new("POST", "/upload")
            .with_file(UploadedFile::new("avatar", "me.png", "image/png", 10, "/tmp/a"))
            .with_file(UploadedFile::new("docs", "a.pdf", "application/pdf", 20, "/tmp/b"))
            .with_file(UploadedFile::new("docs", "b.pdf", "application/pdf", 30, "/tmp/c"));

        let mut cache = UploadCache::new();
        assert!(!cache.is_loaded());

        assert_eq!(cache.instances(&request, "docs").len(), 2);
        assert_eq!(
            cache.instance(&request, "avatar").map(|f| f.file_name.as_str()),
            Some("me.png")
        );
        assert!(cache.instance(&request, "missing").is_none());
        assert!(cache.is_loaded());

        cache.reset();
        assert!(!cache.is_loaded());
    }

    #[test]
    fn test_route_state_reset() {
        let mut route = RouteState {
            requested_route: "site/index".to_string(),
            requested_action: Some("index".to_string()),
            requested_params: BTreeMap::from([("id".to_string(), "7".to_string())]),
        };
        assert!(!route.is_clear());
        route.reset();
        assert!(route.is_clear());
    }

    #[test]
    fn test_request_log_drain() {
        let mut log = RequestLog::new();
        log.push(LogLevel::Info, "app", "hello");
        log.push(LogLevel::Error, "db", "lost connection");
        assert_eq!(log.len(), 2);

        let entries = log.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].category, "db");
        assert!(log.is_empty());
    }
}
