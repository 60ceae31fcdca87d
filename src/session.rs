use serde::Serialize;

use crate::duplicates::{Severity, ValidationOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Idle,
    Checking,
    Clear,
    WarnedDuplicate,
    BlockedDuplicate,
}

/// Per-form duplicate-check state machine.
///
/// Each check gets a generation number; a result is applied only if it still
/// carries the latest generation, so a slow check superseded by a newer
/// keystroke can never overwrite fresh state. The UI debounces keystrokes;
/// this guards the ordering.
#[derive(Debug)]
pub struct FormSession {
    state: CheckState,
    generation: u64,
}

impl FormSession {
    pub fn new() -> FormSession {
        FormSession {
            state: CheckState::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    /// Start a check. Returns the generation token the eventual result must
    /// present to be applied.
    pub fn begin_check(&mut self) -> u64 {
        self.generation += 1;
        self.state = CheckState::Checking;
        self.generation
    }

    /// Apply a finished check. Stale generations are ignored and leave the
    /// state untouched; returns whether the result was applied.
    pub fn apply(&mut self, generation: u64, outcome: &ValidationOutcome) -> bool {
        if generation != self.generation {
            return false;
        }
        self.state = match outcome.severity {
            None => CheckState::Clear,
            Some(Severity::Warning) => CheckState::WarnedDuplicate,
            Some(Severity::Error) => CheckState::BlockedDuplicate,
        };
        true
    }

    /// The operator changed the inputs without a new check yet; any previous
    /// verdict no longer describes the form contents.
    pub fn edited(&mut self) {
        self.generation += 1;
        self.state = CheckState::Idle;
    }

    /// Submission gate: blocked while a check is in flight or after an
    /// error-level duplicate, until the inputs change and a fresh check runs.
    pub fn can_submit(&self) -> bool {
        matches!(
            self.state,
            CheckState::Idle | CheckState::Clear | CheckState::WarnedDuplicate
        )
    }
}

impl Default for FormSession {
    fn default() -> Self {
        FormSession::new()
    }
}
