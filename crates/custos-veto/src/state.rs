//! Veto session transition table

use crate::error::VetoError;
use crate::session::VetoStatus;

/// Validate a status transition
///
/// # Errors
/// Returns `VetoError::IllegalTransition` for edges not in the table
pub fn validate_transition(from: VetoStatus, to: VetoStatus) -> Result<(), VetoError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(VetoError::IllegalTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: VetoStatus) -> &'static [VetoStatus] {
    use VetoStatus::{Cancelled, Committed, Committing, Expired, Reserved, Vetoed};
    match from {
        Reserved => &[Committing, Vetoed, Expired, Cancelled],
        Committing => &[Committed],
        Expired => &[Committing, Cancelled],
        // Post-commit veto
        Committed => &[Vetoed],
        Vetoed | Cancelled => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = VetoStatus> {
        prop_oneof![
            Just(VetoStatus::Reserved),
            Just(VetoStatus::Committing),
            Just(VetoStatus::Committed),
            Just(VetoStatus::Vetoed),
            Just(VetoStatus::Expired),
            Just(VetoStatus::Cancelled),
        ]
    }

    #[test]
    fn reserved_edges() {
        assert!(validate_transition(VetoStatus::Reserved, VetoStatus::Vetoed).is_ok());
        assert!(validate_transition(VetoStatus::Reserved, VetoStatus::Expired).is_ok());
        assert!(validate_transition(VetoStatus::Reserved, VetoStatus::Committed).is_err());
    }

    #[test]
    fn expiry_never_commits_directly() {
        assert!(validate_transition(VetoStatus::Expired, VetoStatus::Committed).is_err());
        assert!(validate_transition(VetoStatus::Expired, VetoStatus::Vetoed).is_err());
        assert!(validate_transition(VetoStatus::Expired, VetoStatus::Committing).is_ok());
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        assert!(allowed_transitions(VetoStatus::Vetoed).is_empty());
        assert!(allowed_transitions(VetoStatus::Cancelled).is_empty());
    }

    proptest! {
        #[test]
        fn validation_matches_table(from in any_status(), to in any_status()) {
            let res = validate_transition(from, to);
            prop_assert_eq!(res.is_ok(), allowed_transitions(from).contains(&to));
        }

        #[test]
        fn no_status_returns_to_reserved(from in any_status()) {
            prop_assert!(validate_transition(from, VetoStatus::Reserved).is_err());
        }
    }
}
