//! The orchestrator (C7). Every mutation follows the same shape: authorize
//! (C6) -> check idempotency (C4) -> open a transaction, take locks in
//! canonical order -> validate the transition (C3) -> write the mutation,
//! gated by version where applicable (C5) -> write the audit entry (C2) ->
//! record the idempotency outcome -> commit.

use crate::audit::{append_audit, AuditEntityKind, AuditEventType};
use crate::authz::{authorize, Capability};
use crate::error::{WorkflowError, WorkflowResult};
use crate::idempotency::{check_replay, record, ReplayDecision};
use crate::ledger::{resolve_and_snapshot, LedgerReader};
use crate::soa;
use crate::state_machine::{request_is_terminal, validate_batch_transition, validate_request_transition};
use crate::store;
use crate::types::*;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

/// Response code conventions mirrored from §4.5.8 — this crate has no HTTP
/// dependency, but idempotency records still need a stable numeric code so
/// a replayed call can be answered without re-running business logic.
pub const CODE_OK: i32 = 200;
pub const CODE_CREATED: i32 = 201;

/// True when `err` is a wrapped deadlock (SQLSTATE 40P01) surfaced through
/// `WorkflowError::Internal`. Every mutating operation below retries such an
/// error exactly once, re-running the whole transaction from scratch since
/// the aborted attempt left no locks or partial writes behind.
fn is_deadlock_error(err: &WorkflowError) -> bool {
    match err {
        WorkflowError::Internal(inner) => inner
            .downcast_ref::<sqlx::Error>()
            .map(crate::error::is_deadlock)
            .unwrap_or(false),
        _ => false,
    }
}

pub struct WorkflowService {
    pool: PgPool,
    ledger: Arc<dyn LedgerReader>,
}

impl WorkflowService {
    pub fn new(pool: PgPool, ledger: Arc<dyn LedgerReader>) -> Self {
        Self { pool, ledger }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---- 4.5.1 Create Batch -------------------------------------------------

    pub async fn create_batch(
        &self,
        principal: Principal,
        title: &str,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentBatch> {
        match self.create_batch_once(principal, title, idempotency_key).await {
            Err(e) if is_deadlock_error(&e) => self.create_batch_once(principal, title, idempotency_key).await,
            other => other,
        }
    }

    async fn create_batch_once(
        &self,
        principal: Principal,
        title: &str,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentBatch> {
        let _span = tracing::info_span!(
            "create_batch",
            operation = OperationName::CreateBatch.as_str(),
            idempotency_key,
            principal_id = %principal.user_id
        )
        .entered();

        authorize(principal, Capability::CreateBatch, None)?;
        if title.trim().is_empty() {
            return Err(WorkflowError::Validation("title must be non-empty".into()));
        }

        let payload = json!({ "title": title });
        match check_replay(&self.pool, idempotency_key, OperationName::CreateBatch, &payload).await? {
            ReplayDecision::Replay(outcome) => {
                return store::fetch_batch(&self.pool, outcome.target_id)
                    .await?
                    .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed batch vanished")));
            }
            ReplayDecision::FirstAttempt { fingerprint } => {
                let mut tx = self.pool.begin().await?;
                let id = Id::new_v4();
                let now = Utc::now();
                let batch = store::insert_batch(&mut tx, id, title, principal.user_id, now).await?;

                append_audit(
                    &mut tx,
                    AuditEventType::BatchCreated,
                    Some(principal.user_id),
                    AuditEntityKind::Batch,
                    batch.id,
                    None,
                    json!({ "status": "DRAFT", "title": title }),
                )
                .await?;

                record(
                    &mut tx,
                    idempotency_key,
                    OperationName::CreateBatch,
                    batch.id,
                    CODE_CREATED,
                    &fingerprint,
                )
                .await?;

                tx.commit().await?;
                Ok(batch)
            }
        }
    }

    // ---- 4.5.2 Add Request to Batch ----------------------------------------

    pub async fn add_request(
        &self,
        principal: Principal,
        batch_id: Id,
        currency: &str,
        shape_input: NewRequestShape,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        match self
            .add_request_once(principal, batch_id, currency, shape_input.clone(), idempotency_key)
            .await
        {
            Err(e) if is_deadlock_error(&e) => {
                self.add_request_once(principal, batch_id, currency, shape_input, idempotency_key)
                    .await
            }
            other => other,
        }
    }

    async fn add_request_once(
        &self,
        principal: Principal,
        batch_id: Id,
        currency: &str,
        shape_input: NewRequestShape,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        let _span = tracing::info_span!(
            "add_request",
            operation = OperationName::CreatePaymentRequest.as_str(),
            idempotency_key,
            %batch_id
        )
        .entered();

        validate_currency(currency)?;

        let payload = json!({ "batch_id": batch_id, "currency": currency, "shape": &shape_input });
        if let ReplayDecision::Replay(outcome) =
            check_replay(&self.pool, idempotency_key, OperationName::CreatePaymentRequest, &payload).await?
        {
            return store::fetch_request(&self.pool, outcome.target_id)
                .await?
                .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed request vanished")));
        }
        let fingerprint = crate::idempotency::fingerprint(&payload);

        let mut tx = self.pool.begin().await?;
        let batch = store::fetch_batch_for_update(&mut tx, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", batch_id))?;

        authorize(principal, Capability::MutateBatchOrRequest, Some(batch.created_by))?;
        if batch.status != BatchStatus::Draft {
            return Err(WorkflowError::InvalidState(
                "batch is not DRAFT; cannot add requests".into(),
            ));
        }

        let id = Id::new_v4();
        let now = Utc::now();
        let request = match shape_input {
            NewRequestShape::Legacy(shape) => {
                if shape.amount <= rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("amount must be > 0".into()));
                }
                store::insert_legacy_request(&mut tx, id, batch_id, currency, &shape, principal.user_id, now)
                    .await?
            }
            NewRequestShape::Ledger(input) => {
                if input.base_amount <= rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("base_amount must be > 0".into()));
                }
                if input.extra_amount < rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("extra_amount must be >= 0".into()));
                }
                let extra_present = !input.extra_amount.is_zero();
                let reason_present = input
                    .extra_reason
                    .as_ref()
                    .map(|r| !r.trim().is_empty())
                    .unwrap_or(false);
                if extra_present != reason_present {
                    return Err(WorkflowError::Validation(
                        "extra_reason must be present iff extra_amount > 0".into(),
                    ));
                }
                let (vendor_id, subcontractor_id) = match input.entity_type {
                    EntityType::Vendor => (Some(input.entity_id), None),
                    EntityType::Subcontractor => (None, Some(input.entity_id)),
                };
                let (entity_name_snapshot, site_code_snapshot) = resolve_and_snapshot(
                    self.ledger.as_ref(),
                    input.entity_type,
                    input.entity_id,
                    input.site_id,
                )
                .await?;

                let shape = LedgerShape {
                    entity_type: input.entity_type,
                    vendor_id,
                    subcontractor_id,
                    site_id: input.site_id,
                    base_amount: input.base_amount,
                    extra_amount: input.extra_amount,
                    extra_reason: input.extra_reason,
                    total_amount: input.base_amount + input.extra_amount,
                    entity_name_snapshot,
                    site_code_snapshot,
                };
                store::insert_ledger_request(&mut tx, id, batch_id, currency, &shape, principal.user_id, now)
                    .await?
            }
        };

        append_audit(
            &mut tx,
            AuditEventType::RequestCreated,
            Some(principal.user_id),
            AuditEntityKind::PaymentRequest,
            request.id,
            None,
            json!({ "status": "DRAFT", "batch_id": batch_id }),
        )
        .await?;

        record(
            &mut tx,
            idempotency_key,
            OperationName::CreatePaymentRequest,
            request.id,
            CODE_CREATED,
            &fingerprint,
        )
        .await?;

        tx.commit().await?;
        Ok(request)
    }

    // ---- 4.5.3 Update Request (DRAFT only) ---------------------------------

    pub async fn update_request(
        &self,
        principal: Principal,
        request_id: Id,
        currency: &str,
        patch: NewRequestShape,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        match self
            .update_request_once(principal, request_id, currency, patch.clone(), idempotency_key)
            .await
        {
            Err(e) if is_deadlock_error(&e) => {
                self.update_request_once(principal, request_id, currency, patch, idempotency_key)
                    .await
            }
            other => other,
        }
    }

    async fn update_request_once(
        &self,
        principal: Principal,
        request_id: Id,
        currency: &str,
        patch: NewRequestShape,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        let _span = tracing::info_span!(
            "update_request",
            operation = OperationName::UpdatePaymentRequest.as_str(),
            idempotency_key,
            %request_id
        )
        .entered();

        validate_currency(currency)?;

        let payload = json!({ "request_id": request_id, "currency": currency, "patch": &patch });
        if let ReplayDecision::Replay(outcome) =
            check_replay(&self.pool, idempotency_key, OperationName::UpdatePaymentRequest, &payload).await?
        {
            return store::fetch_request(&self.pool, outcome.target_id)
                .await?
                .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed request vanished")));
        }
        let fingerprint = crate::idempotency::fingerprint(&payload);

        let mut tx = self.pool.begin().await?;
        let request = store::fetch_request_for_update(&mut tx, request_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("payment request", request_id))?;
        let batch = store::fetch_batch_for_update(&mut tx, request.batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", request.batch_id))?;

        authorize(principal, Capability::MutateBatchOrRequest, Some(batch.created_by))?;
        if batch.status != BatchStatus::Draft {
            return Err(WorkflowError::InvalidState(
                "batch is not DRAFT; cannot update its requests".into(),
            ));
        }
        if request.status != RequestStatus::Draft {
            return Err(WorkflowError::InvalidState(
                "only DRAFT requests may be updated".into(),
            ));
        }

        let previous_state = json!({ "version": request.version });
        let now = Utc::now();
        match patch {
            NewRequestShape::Legacy(shape) => {
                if shape.amount <= rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("amount must be > 0".into()));
                }
                store::update_legacy_request_fields_gated(
                    &mut tx,
                    request_id,
                    request.version,
                    &shape,
                    currency,
                    principal.user_id,
                    now,
                )
                .await?;
            }
            NewRequestShape::Ledger(input) => {
                if input.base_amount <= rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("base_amount must be > 0".into()));
                }
                if input.extra_amount < rust_decimal::Decimal::ZERO {
                    return Err(WorkflowError::Validation("extra_amount must be >= 0".into()));
                }
                let extra_present = !input.extra_amount.is_zero();
                let reason_present = input
                    .extra_reason
                    .as_ref()
                    .map(|r| !r.trim().is_empty())
                    .unwrap_or(false);
                if extra_present != reason_present {
                    return Err(WorkflowError::Validation(
                        "extra_reason must be present iff extra_amount > 0".into(),
                    ));
                }
                let (vendor_id, subcontractor_id) = match input.entity_type {
                    EntityType::Vendor => (Some(input.entity_id), None),
                    EntityType::Subcontractor => (None, Some(input.entity_id)),
                };
                let (entity_name_snapshot, site_code_snapshot) = resolve_and_snapshot(
                    self.ledger.as_ref(),
                    input.entity_type,
                    input.entity_id,
                    input.site_id,
                )
                .await?;
                let shape = LedgerShape {
                    entity_type: input.entity_type,
                    vendor_id,
                    subcontractor_id,
                    site_id: input.site_id,
                    base_amount: input.base_amount,
                    extra_amount: input.extra_amount,
                    extra_reason: input.extra_reason,
                    total_amount: input.base_amount + input.extra_amount,
                    entity_name_snapshot,
                    site_code_snapshot,
                };
                store::update_ledger_request_fields_gated(
                    &mut tx,
                    request_id,
                    request.version,
                    &shape,
                    currency,
                    principal.user_id,
                    now,
                )
                .await?;
            }
        }

        append_audit(
            &mut tx,
            AuditEventType::RequestUpdated,
            Some(principal.user_id),
            AuditEntityKind::PaymentRequest,
            request_id,
            Some(previous_state),
            json!({ "version": request.version + 1 }),
        )
        .await?;

        record(
            &mut tx,
            idempotency_key,
            OperationName::UpdatePaymentRequest,
            request_id,
            CODE_OK,
            &fingerprint,
        )
        .await?;

        tx.commit().await?;
        store::fetch_request(&self.pool, request_id)
            .await?
            .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("request vanished after update")))
    }

    // ---- 4.5.4 Submit Batch -------------------------------------------------

    pub async fn submit_batch(&self, principal: Principal, batch_id: Id) -> WorkflowResult<PaymentBatch> {
        match self.submit_batch_once(principal, batch_id).await {
            Err(e) if is_deadlock_error(&e) => self.submit_batch_once(principal, batch_id).await,
            other => other,
        }
    }

    async fn submit_batch_once(&self, principal: Principal, batch_id: Id) -> WorkflowResult<PaymentBatch> {
        let _span = tracing::info_span!(
            "submit_batch",
            operation = OperationName::SubmitBatch.as_str(),
            %batch_id
        )
        .entered();

        let mut tx = self.pool.begin().await?;
        let batch = store::fetch_batch_for_update(&mut tx, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", batch_id))?;

        authorize(principal, Capability::MutateBatchOrRequest, Some(batch.created_by))?;

        if matches!(batch.status, BatchStatus::Submitted | BatchStatus::Processing) {
            tx.commit().await?;
            return Ok(batch);
        }
        if batch.status != BatchStatus::Draft {
            return Err(WorkflowError::InvalidState(
                "batch must be DRAFT to submit".into(),
            ));
        }

        let requests = store::fetch_batch_requests_for_update(&mut tx, batch_id).await?;
        if requests.is_empty() {
            return Err(WorkflowError::PreconditionFailed(
                "cannot submit an empty batch".into(),
            ));
        }
        for request in &requests {
            if request.status != RequestStatus::Draft {
                return Err(WorkflowError::InvalidState(format!(
                    "request '{}' is not DRAFT",
                    request.id
                )));
            }
            validate_request_transition(RequestStatus::Draft, RequestStatus::Submitted)
                .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;
            validate_request_transition(RequestStatus::Submitted, RequestStatus::PendingApproval)
                .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;
        }
        validate_batch_transition(BatchStatus::Draft, BatchStatus::Submitted)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;
        validate_batch_transition(BatchStatus::Submitted, BatchStatus::Processing)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;

        let now = Utc::now();
        for request in &requests {
            store::update_request_status_gated(
                &mut tx,
                request.id,
                request.version,
                RequestStatus::PendingApproval,
                principal.user_id,
                now,
            )
            .await?;
            append_audit(
                &mut tx,
                AuditEventType::RequestSubmitted,
                Some(principal.user_id),
                AuditEntityKind::PaymentRequest,
                request.id,
                Some(json!({ "status": "DRAFT" })),
                json!({ "status": "PENDING_APPROVAL" }),
            )
            .await?;
        }

        store::update_batch_status(&mut tx, batch_id, BatchStatus::Processing, Some(now), None).await?;
        append_audit(
            &mut tx,
            AuditEventType::BatchSubmitted,
            Some(principal.user_id),
            AuditEntityKind::Batch,
            batch_id,
            Some(json!({ "status": "DRAFT" })),
            json!({ "status": "PROCESSING" }),
        )
        .await?;

        tx.commit().await?;
        store::fetch_batch(&self.pool, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("batch vanished after submit")))
    }

    // ---- 4.5.5 Cancel Batch -------------------------------------------------

    pub async fn cancel_batch(&self, principal: Principal, batch_id: Id) -> WorkflowResult<PaymentBatch> {
        match self.cancel_batch_once(principal, batch_id).await {
            Err(e) if is_deadlock_error(&e) => self.cancel_batch_once(principal, batch_id).await,
            other => other,
        }
    }

    async fn cancel_batch_once(&self, principal: Principal, batch_id: Id) -> WorkflowResult<PaymentBatch> {
        let _span = tracing::info_span!(
            "cancel_batch",
            operation = OperationName::CancelBatch.as_str(),
            %batch_id
        )
        .entered();

        let mut tx = self.pool.begin().await?;
        let batch = store::fetch_batch_for_update(&mut tx, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", batch_id))?;

        authorize(principal, Capability::MutateBatchOrRequest, Some(batch.created_by))?;

        if batch.status == BatchStatus::Cancelled {
            tx.commit().await?;
            return Ok(batch);
        }
        validate_batch_transition(batch.status, BatchStatus::Cancelled)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;

        let now = Utc::now();
        store::update_batch_status(&mut tx, batch_id, BatchStatus::Cancelled, Some(now), Some(now)).await?;
        append_audit(
            &mut tx,
            AuditEventType::BatchCancelled,
            Some(principal.user_id),
            AuditEntityKind::Batch,
            batch_id,
            Some(json!({ "status": store::batch_status_str(batch.status) })),
            json!({ "status": "CANCELLED" }),
        )
        .await?;

        tx.commit().await?;
        store::fetch_batch(&self.pool, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("batch vanished after cancel")))
    }

    // ---- 4.5.6 Approve / Reject Request ------------------------------------

    async fn decide_request(
        &self,
        principal: Principal,
        request_id: Id,
        decision: ApprovalDecision,
        comment: Option<&str>,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        match self
            .decide_request_once(principal, request_id, decision, comment, idempotency_key)
            .await
        {
            Err(e) if is_deadlock_error(&e) => {
                self.decide_request_once(principal, request_id, decision, comment, idempotency_key)
                    .await
            }
            other => other,
        }
    }

    async fn decide_request_once(
        &self,
        principal: Principal,
        request_id: Id,
        decision: ApprovalDecision,
        comment: Option<&str>,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        authorize(principal, Capability::ListPendingApprove, None)?;

        let operation = match decision {
            ApprovalDecision::Approved => OperationName::ApprovePaymentRequest,
            ApprovalDecision::Rejected => OperationName::RejectPaymentRequest,
        };
        let payload = json!({ "request_id": request_id, "comment": comment });
        if let ReplayDecision::Replay(outcome) =
            check_replay(&self.pool, idempotency_key, operation, &payload).await?
        {
            return store::fetch_request(&self.pool, outcome.target_id)
                .await?
                .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed request vanished")));
        }
        let fingerprint = crate::idempotency::fingerprint(&payload);

        let mut tx = self.pool.begin().await?;
        // Approve/reject must not act on a read that a concurrent writer
        // later invalidates within the same transaction; read committed's
        // per-statement snapshot isn't enough here.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        let request = store::fetch_request_for_update(&mut tx, request_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("payment request", request_id))?;

        if request.status != RequestStatus::PendingApproval {
            return Err(WorkflowError::InvalidState(
                "request is not PENDING_APPROVAL".into(),
            ));
        }
        if store::find_approval_record_for_request(&mut tx, request_id)
            .await?
            .is_some()
        {
            return Err(WorkflowError::Conflict(
                "an approval record already exists for this request".into(),
            ));
        }

        let target_status = match decision {
            ApprovalDecision::Approved => RequestStatus::Approved,
            ApprovalDecision::Rejected => RequestStatus::Rejected,
        };
        validate_request_transition(RequestStatus::PendingApproval, target_status)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;

        let now = Utc::now();
        store::update_request_status_gated(
            &mut tx,
            request_id,
            request.version,
            target_status,
            principal.user_id,
            now,
        )
        .await?;

        let approval_id = Id::new_v4();
        store::insert_approval_record(
            &mut tx,
            approval_id,
            request_id,
            principal.user_id,
            decision,
            comment,
            now,
        )
        .await?;

        append_audit(
            &mut tx,
            AuditEventType::ApprovalRecorded,
            Some(principal.user_id),
            AuditEntityKind::PaymentRequest,
            request_id,
            Some(json!({ "status": "PENDING_APPROVAL" })),
            json!({ "status": store::request_status_str(target_status) }),
        )
        .await?;

        record(&mut tx, idempotency_key, operation, request_id, CODE_OK, &fingerprint).await?;

        tx.commit().await?;
        store::fetch_request(&self.pool, request_id)
            .await?
            .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("request vanished after decision")))
    }

    pub async fn approve_request(
        &self,
        principal: Principal,
        request_id: Id,
        comment: Option<&str>,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        self.decide_request(principal, request_id, ApprovalDecision::Approved, comment, idempotency_key)
            .await
    }

    pub async fn reject_request(
        &self,
        principal: Principal,
        request_id: Id,
        comment: Option<&str>,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        self.decide_request(principal, request_id, ApprovalDecision::Rejected, comment, idempotency_key)
            .await
    }

    // ---- 4.5.7 Mark Paid ----------------------------------------------------

    pub async fn mark_paid(
        &self,
        principal: Principal,
        request_id: Id,
        idempotency_key: &str,
    ) -> WorkflowResult<PaymentRequest> {
        let _span = tracing::info_span!(
            "mark_paid",
            operation = OperationName::MarkPaymentPaid.as_str(),
            idempotency_key,
            %request_id
        )
        .entered();

        authorize(principal, Capability::MarkPaid, None)?;

        let payload = json!({ "request_id": request_id });
        if let ReplayDecision::Replay(outcome) =
            check_replay(&self.pool, idempotency_key, OperationName::MarkPaymentPaid, &payload).await?
        {
            return store::fetch_request(&self.pool, outcome.target_id)
                .await?
                .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed request vanished")));
        }
        let fingerprint = crate::idempotency::fingerprint(&payload);

        let batch_id = match self.mark_paid_tx_once(principal, request_id, idempotency_key, &fingerprint).await {
            Err(e) if is_deadlock_error(&e) => {
                self.mark_paid_tx_once(principal, request_id, idempotency_key, &fingerprint).await?
            }
            other => other?,
        };

        // Breaking the request/batch update cycle (§9): the request's
        // transaction is already committed; batch closure is a second,
        // independent transaction and is an idempotent function of sibling
        // statuses, so re-running it after a crash is always safe.
        self.maybe_complete_batch(principal, batch_id).await?;

        store::fetch_request(&self.pool, request_id)
            .await?
            .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("request vanished after mark_paid")))
    }

    async fn mark_paid_tx_once(
        &self,
        principal: Principal,
        request_id: Id,
        idempotency_key: &str,
        fingerprint: &str,
    ) -> WorkflowResult<Id> {
        let mut tx = self.pool.begin().await?;
        let request = store::fetch_request_for_update(&mut tx, request_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("payment request", request_id))?;
        let batch_id = request.batch_id;

        if request.status != RequestStatus::Approved {
            return Err(WorkflowError::InvalidState(
                "request must be APPROVED to mark paid".into(),
            ));
        }
        validate_request_transition(RequestStatus::Approved, RequestStatus::Paid)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;

        let now = Utc::now();
        store::update_request_status_gated(
            &mut tx,
            request_id,
            request.version,
            RequestStatus::Paid,
            principal.user_id,
            now,
        )
        .await?;

        append_audit(
            &mut tx,
            AuditEventType::RequestPaid,
            Some(principal.user_id),
            AuditEntityKind::PaymentRequest,
            request_id,
            Some(json!({ "status": "APPROVED" })),
            json!({ "status": "PAID" }),
        )
        .await?;

        record(
            &mut tx,
            idempotency_key,
            OperationName::MarkPaymentPaid,
            request_id,
            CODE_OK,
            fingerprint,
        )
        .await?;

        tx.commit().await?;
        Ok(batch_id)
    }

    async fn maybe_complete_batch(&self, principal: Principal, batch_id: Id) -> WorkflowResult<()> {
        match self.maybe_complete_batch_once(principal, batch_id).await {
            Err(e) if is_deadlock_error(&e) => self.maybe_complete_batch_once(principal, batch_id).await,
            other => other,
        }
    }

    async fn maybe_complete_batch_once(&self, principal: Principal, batch_id: Id) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        let batch = store::fetch_batch_for_update(&mut tx, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", batch_id))?;

        if batch.status != BatchStatus::Processing {
            tx.commit().await?;
            return Ok(());
        }

        let siblings = store::fetch_batch_requests_for_update(&mut tx, batch_id).await?;
        let all_terminal = siblings.iter().all(|r| request_is_terminal(r.status));
        if !all_terminal {
            tx.commit().await?;
            return Ok(());
        }

        validate_batch_transition(BatchStatus::Processing, BatchStatus::Completed)
            .map_err(|e| WorkflowError::InvalidState(e.to_string()))?;

        let now = Utc::now();
        store::update_batch_status(&mut tx, batch_id, BatchStatus::Completed, None, Some(now)).await?;
        append_audit(
            &mut tx,
            AuditEventType::BatchCompleted,
            Some(principal.user_id),
            AuditEntityKind::Batch,
            batch_id,
            Some(json!({ "status": "PROCESSING" })),
            json!({ "status": "COMPLETED" }),
        )
        .await?;
        tx.commit().await?;

        self.generate_soa_for_batch(principal, batch_id).await?;
        Ok(())
    }

    // ---- 4.7 SOA Versioning --------------------------------------------------

    pub async fn upload_soa(
        &self,
        principal: Principal,
        request_id: Id,
        document_reference: &str,
        idempotency_key: &str,
    ) -> WorkflowResult<SoaVersion> {
        match self
            .upload_soa_once(principal, request_id, document_reference, idempotency_key)
            .await
        {
            Err(e) if is_deadlock_error(&e) => {
                self.upload_soa_once(principal, request_id, document_reference, idempotency_key)
                    .await
            }
            other => other,
        }
    }

    async fn upload_soa_once(
        &self,
        principal: Principal,
        request_id: Id,
        document_reference: &str,
        idempotency_key: &str,
    ) -> WorkflowResult<SoaVersion> {
        let _span = tracing::info_span!(
            "upload_soa",
            operation = OperationName::UploadSoa.as_str(),
            idempotency_key,
            %request_id
        )
        .entered();

        let payload = json!({ "request_id": request_id, "document_reference": document_reference });
        if let ReplayDecision::Replay(outcome) =
            check_replay(&self.pool, idempotency_key, OperationName::UploadSoa, &payload).await?
        {
            return soa::list_versions_for_request(&self.pool, request_id)
                .await?
                .into_iter()
                .find(|v| v.id == outcome.target_id)
                .ok_or_else(|| WorkflowError::internal(anyhow::anyhow!("replayed SOA version vanished")));
        }
        let fingerprint = crate::idempotency::fingerprint(&payload);

        let mut tx = self.pool.begin().await?;
        let request = store::fetch_request_for_update(&mut tx, request_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("payment request", request_id))?;
        let batch = store::fetch_batch_for_update(&mut tx, request.batch_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("batch", request.batch_id))?;

        authorize(principal, Capability::UploadSoa, Some(batch.created_by))?;
        if request.status != RequestStatus::Draft {
            return Err(WorkflowError::InvalidState(
                "SOA uploads are only allowed while the request is DRAFT".into(),
            ));
        }

        let now = Utc::now();
        let version = soa::insert_version(
            &mut tx,
            request_id,
            document_reference,
            SoaSource::Upload,
            Some(principal.user_id),
            now,
        )
        .await?;

        append_audit(
            &mut tx,
            AuditEventType::SoaUploaded,
            Some(principal.user_id),
            AuditEntityKind::Soa,
            version.id,
            None,
            json!({ "request_id": request_id, "version_number": version.version_number }),
        )
        .await?;

        record(
            &mut tx,
            idempotency_key,
            OperationName::UploadSoa,
            version.id,
            CODE_CREATED,
            &fingerprint,
        )
        .await?;

        tx.commit().await?;
        Ok(version)
    }

    /// Idempotent: a batch's SOA set is generated exactly once, the first
    /// time the batch reaches COMPLETED.
    pub async fn generate_soa_for_batch(&self, principal: Principal, batch_id: Id) -> WorkflowResult<()> {
        let requests = match self.lock_batch_requests_for_soa_once(batch_id).await {
            Err(e) if is_deadlock_error(&e) => self.lock_batch_requests_for_soa_once(batch_id).await?,
            other => other?,
        };
        let Some(requests) = requests else { return Ok(()) };

        for request in requests {
            match self.generate_soa_version_once(principal, &request).await {
                Err(e) if is_deadlock_error(&e) => {
                    self.generate_soa_version_once(principal, &request).await?
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Returns `None` once SOA generation has already run for this batch.
    async fn lock_batch_requests_for_soa_once(&self, batch_id: Id) -> WorkflowResult<Option<Vec<PaymentRequest>>> {
        let mut tx = self.pool.begin().await?;
        if soa::any_generated_exists_for_batch(&mut tx, batch_id).await? {
            tx.commit().await?;
            return Ok(None);
        }

        let requests = store::fetch_batch_requests_for_update(&mut tx, batch_id).await?;
        tx.commit().await?;
        Ok(Some(requests))
    }

    async fn generate_soa_version_once(&self, principal: Principal, request: &PaymentRequest) -> WorkflowResult<()> {
        let mut tx = self.pool.begin().await?;
        let document_reference = format!("soa-generated/{}", request.id);
        let version = soa::insert_version(
            &mut tx,
            request.id,
            &document_reference,
            SoaSource::Generated,
            None,
            Utc::now(),
        )
        .await?;
        append_audit(
            &mut tx,
            AuditEventType::SoaGenerated,
            Some(principal.user_id),
            AuditEntityKind::Soa,
            version.id,
            None,
            json!({ "request_id": request.id, "version_number": version.version_number }),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn validate_currency(currency: &str) -> WorkflowResult<()> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(WorkflowError::Validation(
            "currency must be a three-letter ISO-4217 code".into(),
        ));
    }
    Ok(())
}

/// Caller-supplied shape for add_request / update_request, prior to ledger
/// resolution (which fills in the snapshot fields).
#[derive(Debug, Clone, serde::Serialize)]
pub enum NewRequestShape {
    Legacy(LegacyShape),
    Ledger(NewLedgerRequest),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NewLedgerRequest {
    pub entity_type: EntityType,
    pub entity_id: Id,
    pub site_id: Id,
    pub base_amount: rust_decimal::Decimal,
    pub extra_amount: rust_decimal::Decimal,
    pub extra_reason: Option<String>,
}
