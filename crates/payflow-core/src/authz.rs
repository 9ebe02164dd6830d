use crate::error::WorkflowError;
use crate::types::{Id, Principal, Role};

/// The operations the authorization gate knows how to check. Distinct from
/// `OperationName` (used for idempotency scoping) because a few read-side
/// calls (list pending, read batch) have no idempotency key but still need
/// a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadBatchOrRequest,
    CreateBatch,
    MutateBatchOrRequest,
    UploadSoa,
    ListPendingApprove,
    MarkPaid,
    LedgerOrUserAdmin,
}

/// True if `role` alone grants `capability`, independent of ownership.
fn role_allows(role: Role, capability: Capability) -> bool {
    use Capability::*;
    use Role::*;
    match capability {
        ReadBatchOrRequest => true,
        CreateBatch => matches!(role, Creator | Admin),
        MutateBatchOrRequest => matches!(role, Creator | Admin),
        UploadSoa => matches!(role, Creator | Admin),
        ListPendingApprove => matches!(role, Approver | Admin),
        MarkPaid => matches!(role, Creator | Approver | Admin),
        LedgerOrUserAdmin => matches!(role, Admin),
    }
}

/// Whether `capability` is ownership-scoped for `role` (i.e. a non-admin
/// still needs `principal.user_id == owner_id` even after `role_allows`).
fn requires_ownership(role: Role, capability: Capability) -> bool {
    use Capability::*;
    use Role::*;
    role != Admin && matches!(capability, MutateBatchOrRequest | UploadSoa)
}

/// Checks role (and, where the matrix requires it, ownership) before any
/// store write. Never consults the request body for the role.
pub fn authorize(
    principal: Principal,
    capability: Capability,
    owner_id: Option<Id>,
) -> Result<(), WorkflowError> {
    if !role_allows(principal.role, capability) {
        return Err(WorkflowError::Forbidden(format!(
            "role {:?} may not perform {capability:?}",
            principal.role
        )));
    }
    if requires_ownership(principal.role, capability) {
        let owner = owner_id.ok_or_else(|| {
            WorkflowError::internal(anyhow::anyhow!(
                "ownership check requested without an owner_id"
            ))
        })?;
        if principal.user_id != owner {
            return Err(WorkflowError::Forbidden(
                "principal does not own this batch".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn principal(role: Role, id: Id) -> Principal {
        Principal { user_id: id, role }
    }

    #[test]
    fn viewer_cannot_create_batch() {
        let p = principal(Role::Viewer, Uuid::new_v4());
        assert!(authorize(p, Capability::CreateBatch, None).is_err());
    }

    #[test]
    fn creator_can_create_batch() {
        let p = principal(Role::Creator, Uuid::new_v4());
        assert!(authorize(p, Capability::CreateBatch, None).is_ok());
    }

    #[test]
    fn creator_cannot_mutate_others_batch() {
        let owner = Uuid::new_v4();
        let p = principal(Role::Creator, Uuid::new_v4());
        assert!(authorize(p, Capability::MutateBatchOrRequest, Some(owner)).is_err());
    }

    #[test]
    fn creator_can_mutate_own_batch() {
        let owner = Uuid::new_v4();
        let p = principal(Role::Creator, owner);
        assert!(authorize(p, Capability::MutateBatchOrRequest, Some(owner)).is_ok());
    }

    #[test]
    fn admin_bypasses_ownership() {
        let owner = Uuid::new_v4();
        let p = principal(Role::Admin, Uuid::new_v4());
        assert!(authorize(p, Capability::MutateBatchOrRequest, Some(owner)).is_ok());
    }

    #[test]
    fn approver_can_list_pending_but_not_create_batch() {
        let p = principal(Role::Approver, Uuid::new_v4());
        assert!(authorize(p, Capability::ListPendingApprove, None).is_ok());
        assert!(authorize(p, Capability::CreateBatch, None).is_err());
    }

    #[test]
    fn mark_paid_allows_creator_approver_admin_not_viewer() {
        for role in [Role::Creator, Role::Approver, Role::Admin] {
            let p = principal(role, Uuid::new_v4());
            assert!(authorize(p, Capability::MarkPaid, None).is_ok());
        }
        let viewer = principal(Role::Viewer, Uuid::new_v4());
        assert!(authorize(viewer, Capability::MarkPaid, None).is_err());
    }

    #[test]
    fn only_admin_has_ledger_or_user_admin() {
        let admin = principal(Role::Admin, Uuid::new_v4());
        assert!(authorize(admin, Capability::LedgerOrUserAdmin, None).is_ok());
        for role in [Role::Creator, Role::Approver, Role::Viewer] {
            let p = principal(role, Uuid::new_v4());
            assert!(authorize(p, Capability::LedgerOrUserAdmin, None).is_err());
        }
    }
}
