//! Binds each request to its own session.
//!
//! The session engine is persistent, so isolation depends entirely on the
//! order of operations: close whatever is still open, pick the id from the
//! request cookie, open, and close again once the request is handled.

use persistent_worker_core::request::Request;
use persistent_worker_core::response::Cookie;
use persistent_worker_core::session::{SessionBinding, SessionError, SessionStore};

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Whether `id` may be handed to the session engine.
///
/// Accepts 1 to 128 characters from `[A-Za-z0-9,-]`.
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b',' || b == b'-')
}

/// Drives the open/close protocol of a [`SessionStore`].
#[derive(Debug, Clone)]
pub struct SessionBinder {
    cookie_name: String,
    binding: Option<SessionBinding>,
}

impl SessionBinder {
    /// Binder reading the session id from `cookie_name`.
    #[must_use]
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            binding: None,
        }
    }

    /// Name of the session cookie.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Binding of the current request.
    #[must_use]
    pub const fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    /// Open the session for `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if a stale session cannot be closed or the
    /// new one cannot be opened.
    pub fn bind(
        &mut self,
        store: &mut dyn SessionStore,
        request: &Request,
    ) -> Result<&SessionBinding, SessionError> {
        if store.is_active() {
            tracing::warn!(
                session = store.id().unwrap_or_default(),
                "Closing session left open by a previous request"
            );
            store.close()?;
        }
        self.binding = None;

        let requested = request
            .cookie(&self.cookie_name)
            .filter(|id| !id.is_empty())
            .filter(|id| {
                let valid = is_valid_session_id(id);
                if !valid {
                    tracing::warn!(cookie = %self.cookie_name, "Ignoring malformed session id");
                }
                valid
            });

        let session_id = store.open(requested)?;
        let issued = requested != Some(session_id.as_str());
        tracing::debug!(issued, "Session bound");

        Ok(&*self.binding.insert(SessionBinding {
            session_id,
            is_open: true,
            issued,
        }))
    }

    /// Close the session and return the binding of the finished request.
    ///
    /// Closing when nothing is bound is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the engine cannot persist the session.
    pub fn release(&mut self, store: &mut dyn SessionStore) -> Result<Option<SessionBinding>, SessionError> {
        let binding = self.binding.take();
        if store.is_active() {
            store.close()?;
        }
        Ok(binding.map(|binding| SessionBinding {
            is_open: false,
            ..binding
        }))
    }

    /// Cookie announcing a freshly issued id, if the binding needs one.
    #[must_use]
    pub fn cookie_for(&self, binding: &SessionBinding) -> Option<Cookie> {
        binding.issued.then(|| {
            Cookie::new(self.cookie_name.clone(), binding.session_id.clone())
                .with_path("/")
                .http_only()
        })
    }
}
