use std::fmt;

use serde::{Deserialize, Serialize};

/// ランの状態
///
/// `CREATED → LOGGING_IN → (AWAITING_2FA)? → EXTRACTING → COMPLETED`。
/// 終端以外のどの状態からも `FAILED` / `CANCELLED` に遷移できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    LoggingIn,
    #[serde(rename = "AWAITING_2FA")]
    AwaitingTwoFactor,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, LoggingIn)
            | (LoggingIn, AwaitingTwoFactor)
            | (LoggingIn, Extracting)
            | (AwaitingTwoFactor, Extracting)
            | (Extracting, Completed) => true,
            (current, Failed | Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::LoggingIn => "LOGGING_IN",
            RunState::AwaitingTwoFactor => "AWAITING_2FA",
            RunState::Extracting => "EXTRACTING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(RunState::Created.can_transition_to(RunState::LoggingIn));
        assert!(RunState::LoggingIn.can_transition_to(RunState::AwaitingTwoFactor));
        assert!(RunState::AwaitingTwoFactor.can_transition_to(RunState::Extracting));
        assert!(RunState::Extracting.can_transition_to(RunState::Completed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RunState::Failed));
            assert!(!terminal.can_transition_to(RunState::Cancelled));
        }
        assert!(!RunState::Created.can_transition_to(RunState::Completed));
        assert!(!RunState::Extracting.can_transition_to(RunState::AwaitingTwoFactor));
        assert!(RunState::Created.can_transition_to(RunState::Cancelled));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&RunState::AwaitingTwoFactor).unwrap(),
            "\"AWAITING_2FA\""
        );
        assert_eq!(
            serde_json::to_string(&RunState::LoggingIn).unwrap(),
            "\"LOGGING_IN\""
        );
        assert_eq!(RunState::AwaitingTwoFactor.to_string(), "AWAITING_2FA");
    }
}
