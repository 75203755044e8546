//! Session engine contract.
//!
//! The session engine is persistent: it lives in the worker state and is
//! reused by every request. Isolation between requests comes from the
//! open/close protocol driven by the runtime's session binder, never from
//! rebuilding the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a session engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Data access attempted while no session is open.
    #[error("No session is active")]
    NotActive,

    /// `open` called while another session is still open.
    #[error("Session '{0}' is already active")]
    AlreadyActive(String),

    /// The backing store failed.
    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Persistent session engine.
///
/// # Lifecycle
///
/// 1. `open(Some(id))` resumes the session stored under `id`, or starts an
///    empty one under that id. `open(None)` allocates a fresh id.
/// 2. `get`/`set`/`remove` operate on the open session only.
/// 3. `close()` writes the data back and forgets it; closing when nothing
///    is open is a no-op.
pub trait SessionStore: Send {
    /// Open a session, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyActive`] if a session is already open,
    /// or [`SessionError::Storage`] if the backing store cannot be read.
    fn open(&mut self, id: Option<&str>) -> Result<String, SessionError>;

    /// Persist and close the open session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the data cannot be written.
    fn close(&mut self) -> Result<(), SessionError>;

    /// Id of the open session.
    fn id(&self) -> Option<&str>;

    /// Whether a session is open.
    fn is_active(&self) -> bool;

    /// Read a value from the open session.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Write a value into the open session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] if no session is open.
    fn set(&mut self, key: &str, value: Value) -> Result<(), SessionError>;

    /// Remove a value from the open session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] if no session is open.
    fn remove(&mut self, key: &str) -> Result<Option<Value>, SessionError>;
}

/// Session bound to the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    /// Id of the bound session
    pub session_id: String,
    /// Whether the session is still open
    pub is_open: bool,
    /// Whether the engine allocated an id the client does not know yet
    pub issued: bool,
}
