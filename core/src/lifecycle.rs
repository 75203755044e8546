//! Per-request lifecycle state machine.
//!
//! ```text
//! Init → BeforeRequest → Handling → AfterRequest → End
//! ```
//!
//! Transitions are strictly forward and never skip a state. A fresh
//! [`Lifecycle`] is created for every request.

use crate::error::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Worker idle, request accepted
    Init,
    /// Reset sequence running; the before hook fires once it completes
    BeforeRequest,
    /// Request dispatched to the routing/action layer
    Handling,
    /// Response produced; the after hook fires
    AfterRequest,
    /// Terminal; finalize runs
    End,
}

impl LifecycleState {
    /// The only state this one may transition to.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::BeforeRequest),
            Self::BeforeRequest => Some(Self::Handling),
            Self::Handling => Some(Self::AfterRequest),
            Self::AfterRequest => Some(Self::End),
            Self::End => None,
        }
    }

    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End)
    }

    /// Stable name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::BeforeRequest => "before_request",
            Self::Handling => "handling",
            Self::AfterRequest => "after_request",
            Self::End => "end",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the lifecycle of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in [`LifecycleState::Init`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: LifecycleState::Init,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless `to` is the
    /// immediate successor of the current state.
    pub fn advance(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        if self.state.next() == Some(to) {
            self.state = to;
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}
