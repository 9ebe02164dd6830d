//! Repository functions (C1): the only code in this crate that issues SQL.
//! The workflow service (C7) composes these; nothing outside this module
//! knows column names.

use crate::error::WorkflowError;
use crate::types::*;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Postgres, Row, Transaction};

fn row_to_batch(row: &sqlx::postgres::PgRow) -> Result<PaymentBatch, WorkflowError> {
    let status: String = row.try_get("status")?;
    Ok(PaymentBatch {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: parse_batch_status(&status)?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        submitted_at: row.try_get("submitted_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn parse_batch_status(s: &str) -> Result<BatchStatus, WorkflowError> {
    Ok(match s {
        "DRAFT" => BatchStatus::Draft,
        "SUBMITTED" => BatchStatus::Submitted,
        "PROCESSING" => BatchStatus::Processing,
        "COMPLETED" => BatchStatus::Completed,
        "CANCELLED" => BatchStatus::Cancelled,
        other => return Err(WorkflowError::internal(anyhow::anyhow!("bad batch status '{other}'"))),
    })
}

pub fn batch_status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Draft => "DRAFT",
        BatchStatus::Submitted => "SUBMITTED",
        BatchStatus::Processing => "PROCESSING",
        BatchStatus::Completed => "COMPLETED",
        BatchStatus::Cancelled => "CANCELLED",
    }
}

fn parse_request_status(s: &str) -> Result<RequestStatus, WorkflowError> {
    Ok(match s {
        "DRAFT" => RequestStatus::Draft,
        "SUBMITTED" => RequestStatus::Submitted,
        "PENDING_APPROVAL" => RequestStatus::PendingApproval,
        "APPROVED" => RequestStatus::Approved,
        "REJECTED" => RequestStatus::Rejected,
        "PAID" => RequestStatus::Paid,
        other => {
            return Err(WorkflowError::internal(anyhow::anyhow!(
                "bad request status '{other}'"
            )))
        }
    })
}

pub fn request_status_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Draft => "DRAFT",
        RequestStatus::Submitted => "SUBMITTED",
        RequestStatus::PendingApproval => "PENDING_APPROVAL",
        RequestStatus::Approved => "APPROVED",
        RequestStatus::Rejected => "REJECTED",
        RequestStatus::Paid => "PAID",
    }
}

fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<PaymentRequest, WorkflowError> {
    let status: String = row.try_get("status")?;
    let amount: Option<Decimal> = row.try_get("amount")?;
    let shape = if let Some(amount) = amount {
        RequestShape::Legacy(LegacyShape {
            amount,
            beneficiary_name: row.try_get("beneficiary_name")?,
            beneficiary_account: row.try_get("beneficiary_account")?,
            purpose: row.try_get("purpose")?,
        })
    } else {
        let entity_type: String = row.try_get("entity_type")?;
        RequestShape::Ledger(LedgerShape {
            entity_type: match entity_type.as_str() {
                "VENDOR" => EntityType::Vendor,
                "SUBCONTRACTOR" => EntityType::Subcontractor,
                other => {
                    return Err(WorkflowError::internal(anyhow::anyhow!(
                        "bad entity_type '{other}'"
                    )))
                }
            },
            vendor_id: row.try_get("vendor_id")?,
            subcontractor_id: row.try_get("subcontractor_id")?,
            site_id: row.try_get("site_id")?,
            base_amount: row.try_get("base_amount")?,
            extra_amount: row.try_get("extra_amount")?,
            extra_reason: row.try_get("extra_reason")?,
            total_amount: row.try_get("total_amount")?,
            entity_name_snapshot: row.try_get("entity_name_snapshot")?,
            site_code_snapshot: row.try_get("site_code_snapshot")?,
        })
    };

    Ok(PaymentRequest {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        status: parse_request_status(&status)?,
        currency: row.try_get("currency")?,
        shape,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
        version: row.try_get("version")?,
    })
}

const BATCH_COLUMNS: &str = "id, title, status, created_at, created_by, submitted_at, completed_at";
const REQUEST_COLUMNS: &str = "id, batch_id, status, currency, amount, beneficiary_name, beneficiary_account, purpose, \
    entity_type, vendor_id, subcontractor_id, site_id, base_amount, extra_amount, extra_reason, total_amount, \
    entity_name_snapshot, site_code_snapshot, created_at, created_by, updated_at, updated_by, version";

pub async fn insert_batch(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    title: &str,
    created_by: Id,
    now: DateTime<Utc>,
) -> Result<PaymentBatch, WorkflowError> {
    sqlx::query(
        r#"INSERT INTO payment_batches (id, title, status, created_at, created_by)
           VALUES ($1, $2, 'DRAFT', $3, $4)"#,
    )
    .bind(id)
    .bind(title)
    .bind(now)
    .bind(created_by)
    .execute(&mut **tx)
    .await?;

    Ok(PaymentBatch {
        id,
        title: title.to_string(),
        status: BatchStatus::Draft,
        created_at: now,
        created_by,
        submitted_at: None,
        completed_at: None,
    })
}

pub async fn fetch_batch(pool: &sqlx::PgPool, id: Id) -> Result<Option<PaymentBatch>, WorkflowError> {
    let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM payment_batches WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_batch).transpose()
}

pub async fn fetch_batch_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
) -> Result<Option<PaymentBatch>, WorkflowError> {
    let row = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM payment_batches WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(row_to_batch).transpose()
}

pub async fn update_batch_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    status: BatchStatus,
    submitted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<(), WorkflowError> {
    sqlx::query(
        r#"UPDATE payment_batches
           SET status = $2,
               submitted_at = COALESCE($3, submitted_at),
               completed_at = COALESCE($4, completed_at)
           WHERE id = $1"#,
    )
    .bind(id)
    .bind(batch_status_str(status))
    .bind(submitted_at)
    .bind(completed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_legacy_request(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    batch_id: Id,
    currency: &str,
    shape: &LegacyShape,
    created_by: Id,
    now: DateTime<Utc>,
) -> Result<PaymentRequest, WorkflowError> {
    sqlx::query(
        r#"INSERT INTO payment_requests
            (id, batch_id, status, currency, amount, beneficiary_name, beneficiary_account, purpose,
             created_at, created_by, updated_at, updated_by, version)
           VALUES ($1, $2, 'DRAFT', $3, $4, $5, $6, $7, $8, $9, $8, $9, 1)"#,
    )
    .bind(id)
    .bind(batch_id)
    .bind(currency)
    .bind(shape.amount)
    .bind(&shape.beneficiary_name)
    .bind(&shape.beneficiary_account)
    .bind(&shape.purpose)
    .bind(now)
    .bind(created_by)
    .execute(&mut **tx)
    .await?;

    Ok(PaymentRequest {
        id,
        batch_id,
        status: RequestStatus::Draft,
        currency: currency.to_string(),
        shape: RequestShape::Legacy(shape.clone()),
        created_at: now,
        created_by,
        updated_at: now,
        updated_by: created_by,
        version: 1,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_ledger_request(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    batch_id: Id,
    currency: &str,
    shape: &LedgerShape,
    created_by: Id,
    now: DateTime<Utc>,
) -> Result<PaymentRequest, WorkflowError> {
    let entity_type_str = match shape.entity_type {
        EntityType::Vendor => "VENDOR",
        EntityType::Subcontractor => "SUBCONTRACTOR",
    };
    sqlx::query(
        r#"INSERT INTO payment_requests
            (id, batch_id, status, currency, entity_type, vendor_id, subcontractor_id, site_id,
             base_amount, extra_amount, extra_reason, total_amount, entity_name_snapshot, site_code_snapshot,
             created_at, created_by, updated_at, updated_by, version)
           VALUES ($1, $2, 'DRAFT', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $14, $15, 1)"#,
    )
    .bind(id)
    .bind(batch_id)
    .bind(currency)
    .bind(entity_type_str)
    .bind(shape.vendor_id)
    .bind(shape.subcontractor_id)
    .bind(shape.site_id)
    .bind(shape.base_amount)
    .bind(shape.extra_amount)
    .bind(&shape.extra_reason)
    .bind(shape.total_amount)
    .bind(&shape.entity_name_snapshot)
    .bind(&shape.site_code_snapshot)
    .bind(now)
    .bind(created_by)
    .execute(&mut **tx)
    .await?;

    Ok(PaymentRequest {
        id,
        batch_id,
        status: RequestStatus::Draft,
        currency: currency.to_string(),
        shape: RequestShape::Ledger(shape.clone()),
        created_at: now,
        created_by,
        updated_at: now,
        updated_by: created_by,
        version: 1,
    })
}

pub async fn fetch_request(pool: &sqlx::PgPool, id: Id) -> Result<Option<PaymentRequest>, WorkflowError> {
    let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM payment_requests WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_request).transpose()
}

pub async fn fetch_request_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
) -> Result<Option<PaymentRequest>, WorkflowError> {
    let row = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM payment_requests WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(row_to_request).transpose()
}

/// Child-row locking for submit-batch: locked in ascending id order so two
/// concurrent submissions of different batches never deadlock against each
/// other through shared request rows (they can't — requests belong to one
/// batch — but this also keeps a single submission's own lock order fixed
/// and auditable).
pub async fn fetch_batch_requests_for_update(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: Id,
) -> Result<Vec<PaymentRequest>, WorkflowError> {
    let rows = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM payment_requests WHERE batch_id = $1 ORDER BY id ASC FOR UPDATE"
    ))
    .bind(batch_id)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(row_to_request).collect()
}

pub async fn fetch_batch_requests(
    pool: &sqlx::PgPool,
    batch_id: Id,
) -> Result<Vec<PaymentRequest>, WorkflowError> {
    let rows = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM payment_requests WHERE batch_id = $1 ORDER BY id ASC"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_request).collect()
}

/// Status-only transition through the version gate: `version = version + 1`,
/// guarded by `WHERE id = ? AND version = ?` (C5).
pub async fn update_request_status_gated(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    expected_version: i64,
    status: RequestStatus,
    updated_by: Id,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    let result = sqlx::query(
        r#"UPDATE payment_requests
           SET status = $3, updated_at = $4, updated_by = $5, version = version + 1
           WHERE id = $1 AND version = $2"#,
    )
    .bind(id)
    .bind(expected_version)
    .bind(request_status_str(status))
    .bind(now)
    .bind(updated_by)
    .execute(&mut **tx)
    .await?;

    crate::version_gate::require_single_row(result.rows_affected())
}

/// Field-patch update (DRAFT-only edits), also through the version gate.
/// Only legacy-shape fields are covered here; ledger-shape edits go through
/// the same statement shape with the ledger columns instead, composed by
/// the workflow layer which knows which shape is being edited.
#[allow(clippy::too_many_arguments)]
pub async fn update_legacy_request_fields_gated(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    expected_version: i64,
    shape: &LegacyShape,
    currency: &str,
    updated_by: Id,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    let result = sqlx::query(
        r#"UPDATE payment_requests
           SET amount = $3, beneficiary_name = $4, beneficiary_account = $5, purpose = $6,
               currency = $7, updated_at = $8, updated_by = $9, version = version + 1
           WHERE id = $1 AND version = $2"#,
    )
    .bind(id)
    .bind(expected_version)
    .bind(shape.amount)
    .bind(&shape.beneficiary_name)
    .bind(&shape.beneficiary_account)
    .bind(&shape.purpose)
    .bind(currency)
    .bind(now)
    .bind(updated_by)
    .execute(&mut **tx)
    .await?;

    crate::version_gate::require_single_row(result.rows_affected())
}

#[allow(clippy::too_many_arguments)]
pub async fn update_ledger_request_fields_gated(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    expected_version: i64,
    shape: &LedgerShape,
    currency: &str,
    updated_by: Id,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    let entity_type_str = match shape.entity_type {
        EntityType::Vendor => "VENDOR",
        EntityType::Subcontractor => "SUBCONTRACTOR",
    };
    let result = sqlx::query(
        r#"UPDATE payment_requests
           SET entity_type = $3, vendor_id = $4, subcontractor_id = $5, site_id = $6,
               base_amount = $7, extra_amount = $8, extra_reason = $9, total_amount = $10,
               entity_name_snapshot = $11, site_code_snapshot = $12, currency = $13,
               updated_at = $14, updated_by = $15, version = version + 1
           WHERE id = $1 AND version = $2"#,
    )
    .bind(id)
    .bind(expected_version)
    .bind(entity_type_str)
    .bind(shape.vendor_id)
    .bind(shape.subcontractor_id)
    .bind(shape.site_id)
    .bind(shape.base_amount)
    .bind(shape.extra_amount)
    .bind(&shape.extra_reason)
    .bind(shape.total_amount)
    .bind(&shape.entity_name_snapshot)
    .bind(&shape.site_code_snapshot)
    .bind(currency)
    .bind(now)
    .bind(updated_by)
    .execute(&mut **tx)
    .await?;

    crate::version_gate::require_single_row(result.rows_affected())
}

pub async fn insert_approval_record(
    tx: &mut Transaction<'_, Postgres>,
    id: Id,
    request_id: Id,
    approver_id: Id,
    decision: ApprovalDecision,
    comment: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ApprovalRecord, WorkflowError> {
    let decision_str = match decision {
        ApprovalDecision::Approved => "APPROVED",
        ApprovalDecision::Rejected => "REJECTED",
    };
    sqlx::query(
        r#"INSERT INTO approval_records (id, request_id, approver_id, decision, comment, created_at)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(id)
    .bind(request_id)
    .bind(approver_id)
    .bind(decision_str)
    .bind(comment)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(ApprovalRecord {
        id,
        request_id,
        approver_id,
        decision,
        comment: comment.map(str::to_string),
        created_at: now,
    })
}

pub async fn find_approval_record_for_request(
    pool_or_tx: &mut Transaction<'_, Postgres>,
    request_id: Id,
) -> Result<Option<ApprovalRecord>, WorkflowError> {
    let row = sqlx::query(
        r#"SELECT id, request_id, approver_id, decision, comment, created_at
           FROM approval_records WHERE request_id = $1"#,
    )
    .bind(request_id)
    .fetch_optional(&mut **pool_or_tx)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let decision: String = row.try_get("decision")?;
    Ok(Some(ApprovalRecord {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        approver_id: row.try_get("approver_id")?,
        decision: match decision.as_str() {
            "APPROVED" => ApprovalDecision::Approved,
            "REJECTED" => ApprovalDecision::Rejected,
            other => {
                return Err(WorkflowError::internal(anyhow::anyhow!(
                    "bad decision '{other}'"
                )))
            }
        },
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
    }))
}
