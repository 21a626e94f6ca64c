//! Rotation phases and the steps that move between them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{RotationError, RotationResult};

/// Phase of an identity's rotation.
///
/// # Transitions
///
/// ```text
/// STABLE → PENDING_CREATE → PENDING_SET → PENDING_TEST → PENDING_FINISH → STABLE
///                               ↑              │
///                               └──── retry ───┤
///                                              ↓
///                       STABLE ← (ack) ← ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// No rotation in progress
    #[default]
    Stable,
    /// Pending key generated and stored
    PendingCreate,
    /// Pending key registered next to the current one
    PendingSet,
    /// Pending key under test
    PendingTest,
    /// Pending key proven, waiting for promotion
    PendingFinish,
    /// Pending key withdrawn; needs acknowledgement
    RolledBack,
}

impl Phase {
    /// Check if transition to the target phase is valid
    #[must_use]
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, target),
            // Forward progress
            (Stable, PendingCreate)
                | (PendingCreate, PendingSet)
                | (PendingSet, PendingTest)
                | (PendingTest, PendingFinish)
                | (PendingFinish, Stable)
                // Failed test goes back for another attempt
                | (PendingTest, PendingSet)
                // Exhausted test attempts
                | (PendingTest, RolledBack)
                // Operator acknowledgement
                | (RolledBack, Stable)
        )
    }

    /// Validate and perform the transition
    pub fn transition_to(&self, target: Phase) -> RotationResult<Phase> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(RotationError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Position along the forward path; `None` outside a rotation.
    fn ordinal(self) -> Option<u8> {
        match self {
            Phase::PendingCreate => Some(1),
            Phase::PendingSet => Some(2),
            Phase::PendingTest => Some(3),
            Phase::PendingFinish => Some(4),
            Phase::Stable | Phase::RolledBack => None,
        }
    }

    /// Whether a rotation sitting in this phase has already gone beyond `other`.
    #[must_use]
    pub fn is_past(&self, other: Phase) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Stable => write!(f, "STABLE"),
            Phase::PendingCreate => write!(f, "PENDING_CREATE"),
            Phase::PendingSet => write!(f, "PENDING_SET"),
            Phase::PendingTest => write!(f, "PENDING_TEST"),
            Phase::PendingFinish => write!(f, "PENDING_FINISH"),
            Phase::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// One step of the rotation protocol, as named by external schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// createSecret
    Create,
    /// setSecret
    Set,
    /// testSecret
    Test,
    /// finishSecret
    Finish,
}

impl Step {
    /// All steps in protocol order.
    pub const ALL: [Step; 4] = [Step::Create, Step::Set, Step::Test, Step::Finish];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Create => write!(f, "createSecret"),
            Step::Set => write!(f, "setSecret"),
            Step::Test => write!(f, "testSecret"),
            Step::Finish => write!(f, "finishSecret"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn forward_path_is_valid() {
        let mut phase = Phase::Stable;
        for next in [
            Phase::PendingCreate,
            Phase::PendingSet,
            Phase::PendingTest,
            Phase::PendingFinish,
            Phase::Stable,
        ] {
            phase = phase.transition_to(next).unwrap();
        }
        assert_eq!(phase, Phase::Stable);
    }

    #[rstest]
    #[case(Phase::PendingTest, Phase::PendingSet)]
    #[case(Phase::PendingTest, Phase::RolledBack)]
    #[case(Phase::RolledBack, Phase::Stable)]
    fn side_edges_are_valid(#[case] from: Phase, #[case] to: Phase) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Phase::Stable, Phase::PendingSet)]
    #[case(Phase::PendingCreate, Phase::PendingTest)]
    #[case(Phase::PendingSet, Phase::RolledBack)]
    #[case(Phase::PendingFinish, Phase::RolledBack)]
    #[case(Phase::PendingFinish, Phase::PendingSet)]
    #[case(Phase::RolledBack, Phase::PendingCreate)]
    #[case(Phase::Stable, Phase::Stable)]
    fn other_edges_are_rejected(#[case] from: Phase, #[case] to: Phase) {
        assert!(!from.can_transition_to(to));
        assert!(matches!(
            from.transition_to(to),
            Err(RotationError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn ordering_only_covers_pending_phases() {
        assert!(Phase::PendingFinish.is_past(Phase::PendingSet));
        assert!(!Phase::PendingSet.is_past(Phase::PendingSet));
        assert!(!Phase::Stable.is_past(Phase::PendingCreate));
        assert!(!Phase::RolledBack.is_past(Phase::PendingCreate));
    }

    #[test]
    fn phases_render_like_their_persisted_form() {
        assert_eq!(Phase::PendingFinish.to_string(), "PENDING_FINISH");
        assert_eq!(
            serde_json::to_string(&Phase::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
    }
}
