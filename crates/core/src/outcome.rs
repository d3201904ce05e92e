//! Result of a conditional state transition.

use serde::Serialize;

/// Outcome of a single conditional write whose precondition encodes the
/// allowed source states.
///
/// Expected outcomes ("someone else already did it", "not allowed from this
/// state") are values, not errors. Transient failures stay on the `Err` side
/// of the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The row was in an allowed source state and was moved.
    Applied,
    /// The row is already in (or past) the target state; nothing changed.
    AlreadyApplied,
    /// The row exists but its current state does not allow the transition.
    Rejected { current: String },
    /// No such row.
    NotFound,
}

impl TransitionOutcome {
    pub fn rejected(current: impl Into<String>) -> Self {
        Self::Rejected {
            current: current.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Applied now or earlier: the caller may report success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyApplied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_applied_and_already_applied_count_as_success() {
        assert!(TransitionOutcome::Applied.is_success());
        assert!(TransitionOutcome::AlreadyApplied.is_success());
        assert!(!TransitionOutcome::rejected("cancelled").is_success());
        assert!(!TransitionOutcome::NotFound.is_success());
    }

    #[test]
    fn serializes_with_outcome_tag() {
        let json = serde_json::to_value(TransitionOutcome::rejected("cancelled")).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["current"], "cancelled");
    }
}
