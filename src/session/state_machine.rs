//! Conversation state machine. Single authoritative state per session;
//! only this module mutates it. STT/LLM/TTS sub-sessions signal events,
//! they never set state directly.

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Initializing,
    Listening,
    Thinking,
    Responding,
    Interrupted,
    Ended,
}

impl ConversationState {
    fn allowed_targets(self) -> &'static [ConversationState] {
        use ConversationState::*;
        match self {
            Initializing => &[Listening, Ended],
            Listening => &[Thinking, Ended],
            Thinking => &[Responding, Listening, Ended],
            Responding => &[Listening, Interrupted, Ended],
            Interrupted => &[Listening, Ended],
            Ended => &[],
        }
    }

    pub fn can_transition_to(self, target: ConversationState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversationState::Initializing => "INITIALIZING",
            ConversationState::Listening => "LISTENING",
            ConversationState::Thinking => "THINKING",
            ConversationState::Responding => "RESPONDING",
            ConversationState::Interrupted => "INTERRUPTED",
            ConversationState::Ended => "ENDED",
        };
        write!(f, "{s}")
    }
}

/// Owns the current state and validates every transition against the
/// table in `ConversationState::allowed_targets`.
pub struct StateMachine {
    state: ConversationState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConversationState::Initializing,
        }
    }

    pub fn current(&self) -> ConversationState {
        self.state
    }

    /// Attempt a transition. On success the new state is recorded and
    /// returned; the caller is responsible for logging `{from, to}` and
    /// performing the transition's actions (§4.7).
    pub fn transition(&mut self, to: ConversationState) -> Result<ConversationState, GatewayError> {
        if !self.state.can_transition_to(to) {
            return Err(GatewayError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(self.state)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationState::*;

    #[test]
    fn test_happy_path_sequence() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.current(), Initializing);
        assert_eq!(sm.transition(Listening).unwrap(), Listening);
        assert_eq!(sm.transition(Thinking).unwrap(), Thinking);
        assert_eq!(sm.transition(Responding).unwrap(), Responding);
        assert_eq!(sm.transition(Listening).unwrap(), Listening);
    }

    #[test]
    fn test_thinking_can_revert_to_listening_on_error_path() {
        let mut sm = StateMachine::new();
        sm.transition(Listening).unwrap();
        sm.transition(Thinking).unwrap();
        assert_eq!(sm.transition(Listening).unwrap(), Listening);
    }

    #[test]
    fn test_interrupted_path() {
        let mut sm = StateMachine::new();
        sm.transition(Listening).unwrap();
        sm.transition(Thinking).unwrap();
        sm.transition(Responding).unwrap();
        assert_eq!(sm.transition(Interrupted).unwrap(), Interrupted);
        assert_eq!(sm.transition(Listening).unwrap(), Listening);
    }

    #[test]
    fn test_any_state_can_end() {
        for start in [Initializing, Listening, Thinking, Responding, Interrupted] {
            let mut sm = StateMachine { state: start };
            assert!(sm.transition(Ended).is_ok());
        }
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut sm = StateMachine { state: Ended };
        assert!(sm.transition(Listening).is_err());
        assert!(sm.transition(Ended).is_err());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(Thinking).is_err());
        assert!(sm.transition(Responding).is_err());

        sm.transition(Listening).unwrap();
        assert!(sm.transition(Responding).is_err());
        assert!(sm.transition(Interrupted).is_err());
    }

    #[test]
    fn test_invalid_transition_does_not_mutate_state() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(Responding).is_err());
        assert_eq!(sm.current(), Initializing);
    }
}
