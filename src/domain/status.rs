use crate::domain::types::DelegationStatus;
use candid::CandidType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StatusTransitionError {
    pub from: DelegationStatus,
    pub to: DelegationStatus,
    pub reason: String,
}

impl fmt::Display for StatusTransitionError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "invalid status transition {:?} -> {:?}: {}",
            self.from, self.to, self.reason
        )
    }
}

pub fn is_terminal(status: &DelegationStatus) -> bool {
    !matches!(status, DelegationStatus::Pending)
}

/// Validate a status transition.  The only legal moves are one-way exits out
/// of `Pending`; every terminal state is immutable.
pub fn validate_transition(
    current: &DelegationStatus,
    next: &DelegationStatus,
) -> Result<(), StatusTransitionError> {
    use DelegationStatus as S;
    match (current, next) {
        (S::Pending, S::Claimed)
        | (S::Pending, S::Redeemed)
        | (S::Pending, S::Expired)
        | (S::Pending, S::Revoked) => Ok(()),
        (from, to) => Err(StatusTransitionError {
            from: from.clone(),
            to: to.clone(),
            reason: if is_terminal(from) {
                "terminal records are immutable".to_string()
            } else {
                "invalid transition".to_string()
            },
        }),
    }
}
