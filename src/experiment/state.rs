//! Orchestrator control states.

use serde::{Deserialize, Serialize};

/// Control state of the experiment orchestrator.
///
/// # State Machine
///
/// ```text
/// Idle ──apply──> ConfigLoaded ──launch──> Cleaning ──countdown 0──> Running
///   ▲                                        │                          │
///   │                                      stop               final step in window
///   │                                        ▼                          ▼
///   │◄──────────── no restart ───────── Completed ◄────────────── Completing
///   │                                        │
///   │                               restart + orders left
///   │                                        ▼
///   │                                     Cleaning (next order)
///   └── Stopped (stop from Cleaning / Running / Completing, launchable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Nothing running
    Idle,
    /// Order table applied, first order not launched
    ConfigLoaded,
    /// Purge countdown
    Cleaning,
    /// Programs and flow schedules running
    Running,
    /// Completion detected, persisting results
    Completing,
    /// Order finished, waiting for restart
    Completed,
    /// Stopped by the operator
    Stopped,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::ConfigLoaded => write!(f, "ConfigLoaded"),
            ExperimentState::Cleaning => write!(f, "Cleaning"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Completing => write!(f, "Completing"),
            ExperimentState::Completed => write!(f, "Completed"),
            ExperimentState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ExperimentState {
    /// Hardware is busy with an order.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExperimentState::Cleaning | ExperimentState::Running | ExperimentState::Completing
        )
    }

    /// A launch may start from this state (given a loaded table).
    pub fn can_launch(&self) -> bool {
        matches!(
            self,
            ExperimentState::Idle
                | ExperimentState::ConfigLoaded
                | ExperimentState::Completed
                | ExperimentState::Stopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_cannot_launch() {
        for state in [
            ExperimentState::Cleaning,
            ExperimentState::Running,
            ExperimentState::Completing,
        ] {
            assert!(state.is_active());
            assert!(!state.can_launch());
        }
        assert!(ExperimentState::Stopped.can_launch());
        assert_eq!(ExperimentState::ConfigLoaded.to_string(), "ConfigLoaded");
    }
}
