//! Governor lifecycle state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of a governor.
///
/// The PSRLV phases are explicit states so the registry can report exactly
/// where a governor is inside its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorState {
    Uninitialized,
    Initializing,
    Idle,
    Probing,
    Sensing,
    Responding,
    Learning,
    Validating,
    /// Recoverable fault; the driver attempts self-recovery from here.
    Error,
    /// Terminal.
    Stopped,
}

impl GovernorState {
    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Any state may fall into `Error` or be stopped; `Error` may only go
    /// back through `Initializing` (recovery) or end in `Stopped`.
    pub fn can_transition(self, next: GovernorState) -> bool {
        use GovernorState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (_, Stopped) => true,
            (Stopped, _) => false,
            (Error, Initializing) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, Idle) => true,
            (Idle, Probing) => true,
            (Probing, Sensing) => true,
            (Sensing, Responding) => true,
            (Responding, Learning) => true,
            (Learning, Validating) => true,
            (Validating, Idle) => true,
            // A failed cycle aborts back to idle from any phase.
            (s, Idle) if s.in_cycle() => true,
            _ => false,
        }
    }

    /// True while the governor is inside an active PSRLV phase.
    pub fn in_cycle(self) -> bool {
        matches!(
            self,
            GovernorState::Probing
                | GovernorState::Sensing
                | GovernorState::Responding
                | GovernorState::Learning
                | GovernorState::Validating
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GovernorState::*;

    #[test]
    fn test_happy_path_cycle() {
        let cycle = [
            Uninitialized,
            Initializing,
            Idle,
            Probing,
            Sensing,
            Responding,
            Learning,
            Validating,
            Idle,
        ];
        for pair in cycle.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{:?} -> {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_paths() {
        assert!(Probing.can_transition(Error));
        assert!(Idle.can_transition(Error));
        assert!(Error.can_transition(Initializing));
        assert!(Error.can_transition(Stopped));
        assert!(!Error.can_transition(Idle));
        assert!(!Error.can_transition(Probing));
    }

    #[test]
    fn test_stopped_is_terminal() {
        assert!(!Stopped.can_transition(Idle));
        assert!(!Stopped.can_transition(Initializing));
        assert!(!Stopped.can_transition(Error));
    }

    #[test]
    fn test_no_phase_skipping() {
        assert!(!Idle.can_transition(Responding));
        assert!(!Probing.can_transition(Learning));
        assert!(!Sensing.can_transition(Validating));
    }
}
