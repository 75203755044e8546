//! In-memory session engine.

use persistent_worker_core::session::{SessionError, SessionStore};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Session engine keeping every session in a map owned by the worker.
///
/// Data is copied into the open session on `open` and written back on
/// `close`, so nothing a request does is visible to a different session id.
/// A session that closes empty is dropped, so requests that never touch
/// their session leave nothing behind.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, Map<String, Value>>,
    active: Option<(String, Map<String, Value>)>,
}

impl MemorySessionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Persisted value, read without opening the session.
    #[must_use]
    pub fn peek(&self, id: &str, key: &str) -> Option<&Value> {
        self.sessions.get(id).and_then(|data| data.get(key))
    }

    /// Drop a persisted session.
    pub fn destroy(&mut self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl SessionStore for MemorySessionStore {
    fn open(&mut self, id: Option<&str>) -> Result<String, SessionError> {
        if let Some((active, _)) = &self.active {
            return Err(SessionError::AlreadyActive(active.clone()));
        }

        let id = id.map_or_else(Self::generate_id, ToString::to_string);
        let data = self.sessions.get(&id).cloned().unwrap_or_default();
        self.active = Some((id.clone(), data));
        Ok(id)
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if let Some((id, data)) = self.active.take() {
            if data.is_empty() {
                self.sessions.remove(&id);
            } else {
                self.sessions.insert(id, data);
            }
        }
        Ok(())
    }

    fn id(&self) -> Option<&str> {
        self.active.as_ref().map(|(id, _)| id.as_str())
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.active.as_ref().and_then(|(_, data)| data.get(key))
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let (_, data) = self.active.as_mut().ok_or(SessionError::NotActive)?;
        data.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<Option<Value>, SessionError> {
        let (_, data) = self.active.as_mut().ok_or(SessionError::NotActive)?;
        Ok(data.remove(key))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_across_open_close() {
        let mut store = MemorySessionStore::new();
        store.open(Some("u1")).unwrap();
        store.set("counter", json!(1)).unwrap();
        store.close().unwrap();

        store.open(Some("u1")).unwrap();
        assert_eq!(store.get("counter"), Some(&json!(1)));
        store.close().unwrap();
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut store = MemorySessionStore::new();
        store.open(Some("u1")).unwrap();
        store.set("counter", json!(1)).unwrap();
        store.close().unwrap();

        store.open(Some("u2")).unwrap();
        assert!(store.get("counter").is_none());
        store.close().unwrap();
        assert_eq!(store.peek("u1", "counter"), Some(&json!(1)));
    }

    #[test]
    fn test_untouched_sessions_are_not_persisted() {
        let mut store = MemorySessionStore::new();
        for _ in 0..100 {
            store.open(None).unwrap();
            store.close().unwrap();
        }
        assert_eq!(store.session_count(), 0);

        store.open(Some("u1")).unwrap();
        store.set("counter", json!(1)).unwrap();
        store.close().unwrap();
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_session_emptied_by_request_is_dropped() {
        let mut store = MemorySessionStore::new();
        store.open(Some("u1")).unwrap();
        store.set("counter", json!(1)).unwrap();
        store.close().unwrap();

        store.open(Some("u1")).unwrap();
        store.remove("counter").unwrap();
        store.close().unwrap();
        assert_eq!(store.session_count(), 0);
        assert!(store.peek("u1", "counter").is_none());
    }

    #[test]
    fn test_open_without_id_allocates_one() {
        let mut store = MemorySessionStore::new();
        let id = store.open(None).unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(store.id(), Some(id.as_str()));
    }

    #[test]
    fn test_double_open_is_rejected_and_close_is_idempotent() {
        let mut store = MemorySessionStore::new();
        store.open(Some("a")).unwrap();
        assert_eq!(
            store.open(Some("b")),
            Err(SessionError::AlreadyActive("a".to_string()))
        );
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_active());
    }

    #[test]
    fn test_writes_require_open_session() {
        let mut store = MemorySessionStore::new();
        assert_eq!(store.set("k", json!(true)), Err(SessionError::NotActive));
        assert_eq!(store.remove("k"), Err(SessionError::NotActive));
    }
}
