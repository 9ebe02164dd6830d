use crate::types::{BatchStatus, RequestStatus};

/// A transition that the state machine forbids.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub entity_kind: &'static str,
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {} transition: {} -> {}",
            self.entity_kind, self.from, self.to
        )
    }
}

/// Pure function over the PaymentRequest transition graph. No I/O, no store
/// access — called immediately before every status write.
pub fn validate_request_transition(
    current: RequestStatus,
    target: RequestStatus,
) -> Result<(), InvalidTransition> {
    use RequestStatus::*;
    let allowed = matches!(
        (current, target),
        (Draft, Draft)
            | (Draft, Submitted)
            | (Submitted, PendingApproval)
            | (PendingApproval, Approved)
            | (PendingApproval, Rejected)
            | (Approved, Paid)
    );
    if allowed {
        Ok(())
    } else {
        Err(InvalidTransition {
            entity_kind: "PaymentRequest",
            from: format!("{current:?}"),
            to: format!("{target:?}"),
        })
    }
}

/// Pure function over the PaymentBatch transition graph.
pub fn validate_batch_transition(
    current: BatchStatus,
    target: BatchStatus,
) -> Result<(), InvalidTransition> {
    use BatchStatus::*;
    let allowed = matches!(
        (current, target),
        (Draft, Submitted) | (Draft, Cancelled) | (Submitted, Processing) | (Processing, Completed)
    );
    if allowed {
        Ok(())
    } else {
        Err(InvalidTransition {
            entity_kind: "PaymentBatch",
            from: format!("{current:?}"),
            to: format!("{target:?}"),
        })
    }
}

pub fn request_is_terminal(status: RequestStatus) -> bool {
    matches!(status, RequestStatus::Rejected | RequestStatus::Paid)
}

pub fn batch_is_terminal(status: BatchStatus) -> bool {
    matches!(status, BatchStatus::Completed | BatchStatus::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use BatchStatus::*;
    use RequestStatus::*;

    #[test]
    fn request_happy_path_is_allowed() {
        assert!(validate_request_transition(Draft, Submitted).is_ok());
        assert!(validate_request_transition(Submitted, PendingApproval).is_ok());
        assert!(validate_request_transition(PendingApproval, Approved).is_ok());
        assert!(validate_request_transition(Approved, Paid).is_ok());
    }

    #[test]
    fn request_rejects_skipping_pending_approval() {
        let err = validate_request_transition(Submitted, Approved).unwrap_err();
        assert!(err.to_string().contains("Submitted"));
        assert!(err.to_string().contains("Approved"));
    }

    #[test]
    fn request_terminal_states_have_no_successors() {
        for target in [Draft, Submitted, PendingApproval, Approved, Rejected, Paid] {
            assert!(validate_request_transition(Rejected, target).is_err());
            assert!(validate_request_transition(Paid, target).is_err());
        }
    }

    #[test]
    fn request_draft_reedit_is_allowed() {
        assert!(validate_request_transition(Draft, Draft).is_ok());
    }

    #[test]
    fn batch_happy_path_is_allowed() {
        assert!(validate_batch_transition(Draft, Submitted).is_ok());
        assert!(validate_batch_transition(Submitted, Processing).is_ok());
        assert!(validate_batch_transition(Processing, Completed).is_ok());
    }

    #[test]
    fn batch_cancel_only_from_draft() {
        assert!(validate_batch_transition(Draft, Cancelled).is_ok());
        assert!(validate_batch_transition(Submitted, Cancelled).is_err());
        assert!(validate_batch_transition(Processing, Cancelled).is_err());
    }

    #[test]
    fn batch_terminal_states_have_no_successors() {
        for target in [Draft, Submitted, Processing, Completed, Cancelled] {
            assert!(validate_batch_transition(Completed, target).is_err());
            assert!(validate_batch_transition(Cancelled, target).is_err());
        }
    }

    #[test]
    fn terminal_helpers_agree_with_graphs() {
        assert!(request_is_terminal(Rejected));
        assert!(request_is_terminal(Paid));
        assert!(!request_is_terminal(Approved));
        assert!(batch_is_terminal(Completed));
        assert!(batch_is_terminal(Cancelled));
        assert!(!batch_is_terminal(Processing));
    }
}
