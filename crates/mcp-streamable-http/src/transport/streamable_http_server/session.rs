//! Session identity and lifecycle.
//!
//! A session groups the interactions between one client and the server,
//! starting from the `initialize` handshake. In stateful mode the server
//! assigns a [`SessionId`] at initialize (returned via the `Mcp-Session-Id`
//! response header) and the client carries it on every subsequent request.

use std::sync::Arc;

pub type SessionId = Arc<str>;

/// Default session id generator.
pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Zero-arg generator invoked once, at initialize. `None` at the config level
/// selects stateless mode.
pub type SessionIdGenerator = dyn Fn() -> SessionId + Send + Sync;

/// Lifecycle of the transport's single session.
///
/// `Fresh` until the first valid initialize, `Initialized` afterwards
/// (carrying the assigned id, or `None` in stateless mode), and `Closed`
/// after a DELETE or an explicit `close()`. `Closed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Initialized { session_id: Option<SessionId> },
    Closed,
}

impl SessionState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, SessionState::Fresh)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            SessionState::Initialized { session_id } => session_id.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_fresh() {
        let state = SessionState::Fresh;
        assert!(state.is_fresh());
        assert!(state.session_id().is_none());
    }

    #[test]
    fn test_initialized_carries_session_id() {
        let state = SessionState::Initialized {
            session_id: Some(session_id()),
        };
        assert!(!state.is_fresh());
        assert!(state.session_id().is_some());
    }

    #[test]
    fn test_stateless_initialized_has_no_session_id() {
        let state = SessionState::Initialized { session_id: None };
        assert!(state.session_id().is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(session_id(), session_id());
    }
}
