//! Session lifecycle states
//!
//! The running/closing flags of a session are modeled as one explicit state
//! machine with a single transition point, so overlapping event handlers
//! cannot leave the flags disagreeing with each other.

/// Lifecycle state of a managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, no agent activity observed yet
    Starting,
    /// Agent is alive and not producing a response
    Idle,
    /// Agent is actively producing a response
    Active,
    /// Session is shutting down; permanent, no new attachments
    Closing,
}

impl SessionState {
    /// Whether the agent is mid-response
    pub fn is_running(self) -> bool {
        self == SessionState::Active
    }

    /// Whether the session has entered teardown
    pub fn is_closing(self) -> bool {
        self == SessionState::Closing
    }

    /// Apply a transition, returning the resulting state
    ///
    /// `Closing` is terminal: once entered, every requested transition is
    /// ignored.
    pub fn transition(self, next: SessionState) -> SessionState {
        if self.is_closing() {
            return self;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_only_when_active() {
        assert!(SessionState::Active.is_running());
        assert!(!SessionState::Starting.is_running());
        assert!(!SessionState::Idle.is_running());
        assert!(!SessionState::Closing.is_running());
    }

    #[test]
    fn test_closing_is_permanent() {
        let state = SessionState::Closing;
        assert_eq!(state.transition(SessionState::Active), SessionState::Closing);
        assert_eq!(state.transition(SessionState::Idle), SessionState::Closing);
    }

    #[test]
    fn test_normal_transitions() {
        let state = SessionState::Starting;
        let state = state.transition(SessionState::Active);
        assert_eq!(state, SessionState::Active);
        let state = state.transition(SessionState::Idle);
        assert_eq!(state, SessionState::Idle);
    }
}
