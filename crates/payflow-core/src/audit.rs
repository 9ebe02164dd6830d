use crate::error::WorkflowError;
use crate::types::Id;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Postgres, Row, Transaction};

/// The canonical allowed set for audit queries. Per the resolved open
/// question in the design notes, this includes the ledger-side kinds even
/// though one variant of the source system's filter omitted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEntityKind {
    Batch,
    PaymentRequest,
    Soa,
    Client,
    Site,
    Vendor,
    Subcontractor,
    VendorType,
    SubcontractorScope,
}

impl AuditEntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "BATCH",
            Self::PaymentRequest => "PAYMENT_REQUEST",
            Self::Soa => "SOA",
            Self::Client => "CLIENT",
            Self::Site => "SITE",
            Self::Vendor => "VENDOR",
            Self::Subcontractor => "SUBCONTRACTOR",
            Self::VendorType => "VENDOR_TYPE",
            Self::SubcontractorScope => "SUBCONTRACTOR_SCOPE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    BatchCreated,
    RequestCreated,
    RequestUpdated,
    BatchSubmitted,
    RequestSubmitted,
    BatchCancelled,
    ApprovalRecorded,
    RequestPaid,
    BatchCompleted,
    SoaUploaded,
    SoaGenerated,
    SoaDownloaded,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchCreated => "BATCH_CREATED",
            Self::RequestCreated => "REQUEST_CREATED",
            Self::RequestUpdated => "REQUEST_UPDATED",
            Self::BatchSubmitted => "BATCH_SUBMITTED",
            Self::RequestSubmitted => "REQUEST_SUBMITTED",
            Self::BatchCancelled => "BATCH_CANCELLED",
            Self::ApprovalRecorded => "APPROVAL_RECORDED",
            Self::RequestPaid => "REQUEST_PAID",
            Self::BatchCompleted => "BATCH_COMPLETED",
            Self::SoaUploaded => "SOA_UPLOADED",
            Self::SoaGenerated => "SOA_GENERATED",
            Self::SoaDownloaded => "SOA_DOWNLOADED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogRow {
    pub id: Id,
    pub event_type: String,
    pub actor: Option<Id>,
    pub entity_kind: String,
    pub entity_id: Id,
    pub previous_state: Option<Value>,
    pub new_state: Value,
    pub occurred_at: DateTime<Utc>,
    pub entry_hash: String,
}

/// Content hash chaining the new entry to the previous one, mirroring the
/// tamper-evidence scheme used elsewhere in this codebase for append-only
/// logs: every entry's hash folds in the previous entry's hash, so altering
/// a historical row breaks every hash computed after it.
fn compute_entry_hash(
    previous_hash: Option<&str>,
    event_type: &str,
    entity_kind: &str,
    entity_id: Id,
    new_state: &Value,
    occurred_at: DateTime<Utc>,
) -> String {
    let material = serde_json::json!({
        "previous_hash": previous_hash,
        "event_type": event_type,
        "entity_kind": entity_kind,
        "entity_id": entity_id,
        "new_state": new_state,
        "occurred_at": occurred_at.to_rfc3339(),
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Appends exactly one audit entry, within the caller's transaction, before
/// the idempotency record is written (§4.6). Must be called after the
/// mutation it describes has been written but before the transaction
/// commits, so a rollback discards the audit entry along with everything
/// else.
///
/// The "previous hash" lookup is a best-effort read of the latest row
/// without an explicit lock: audit writes for genuinely concurrent,
/// lock-free mutations (e.g. two `create_batch` calls) may interleave their
/// hash chain non-deterministically, but the append-only guarantee itself
/// is enforced at the database level (see migrations) regardless of chain
/// ordering.
pub async fn append_audit(
    tx: &mut Transaction<'_, Postgres>,
    event_type: AuditEventType,
    actor: Option<Id>,
    entity_kind: AuditEntityKind,
    entity_id: Id,
    previous_state: Option<Value>,
    new_state: Value,
) -> Result<AuditLogRow, WorkflowError> {
    let previous_hash: Option<String> =
        sqlx::query("SELECT entry_hash FROM audit_log ORDER BY occurred_at DESC, id DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| row.try_get::<String, _>("entry_hash"))
            .transpose()?;

    let occurred_at = Utc::now();
    let entry_hash = compute_entry_hash(
        previous_hash.as_deref(),
        event_type.as_str(),
        entity_kind.as_str(),
        entity_id,
        &new_state,
        occurred_at,
    );

    let id = Id::new_v4();
    sqlx::query(
        r#"
        INSERT INTO audit_log
            (id, event_type, actor, entity_kind, entity_id, previous_state, new_state, occurred_at, previous_hash, entry_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(id)
    .bind(event_type.as_str())
    .bind(actor)
    .bind(entity_kind.as_str())
    .bind(entity_id)
    .bind(&previous_state)
    .bind(&new_state)
    .bind(occurred_at)
    .bind(&previous_hash)
    .bind(&entry_hash)
    .execute(&mut **tx)
    .await?;

    tracing::debug!(
        event_type = event_type.as_str(),
        entity_kind = entity_kind.as_str(),
        %entity_id,
        "audit entry written"
    );

    Ok(AuditLogRow {
        id,
        event_type: event_type.as_str().to_string(),
        actor,
        entity_kind: entity_kind.as_str().to_string(),
        entity_id,
        previous_state,
        new_state,
        occurred_at,
        entry_hash,
    })
}

/// Read-only filter for the audit log query contract of §6.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub entity_kind: Option<AuditEntityKind>,
    pub entity_id: Option<Id>,
    pub actor_id: Option<Id>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn query_audit_log(
    pool: &sqlx::PgPool,
    query: &AuditQuery,
) -> Result<Vec<AuditLogRow>, WorkflowError> {
    let rows = sqlx::query(
        r#"
        SELECT id, event_type, actor, entity_kind, entity_id, previous_state, new_state, occurred_at, entry_hash
        FROM audit_log
        WHERE ($1::text IS NULL OR entity_kind = $1)
          AND ($2::uuid IS NULL OR entity_id = $2)
          AND ($3::uuid IS NULL OR actor = $3)
          AND ($4::timestamptz IS NULL OR occurred_at >= $4)
          AND ($5::timestamptz IS NULL OR occurred_at <= $5)
        ORDER BY occurred_at ASC, id ASC
        LIMIT $6 OFFSET $7
        "#,
    )
    .bind(query.entity_kind.map(AuditEntityKind::as_str))
    .bind(query.entity_id)
    .bind(query.actor_id)
    .bind(query.from)
    .bind(query.to)
    .bind(query.limit.max(1))
    .bind(query.offset.max(0))
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(AuditLogRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            actor: row.try_get("actor")?,
            entity_kind: row.try_get("entity_kind")?,
            entity_id: row.try_get("entity_id")?,
            previous_state: row.try_get("previous_state")?,
            new_state: row.try_get("new_state")?,
            occurred_at: row.try_get("occurred_at")?,
            entry_hash: row.try_get("entry_hash")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_hash_changes_when_previous_hash_changes() {
        let now = Utc::now();
        let state = serde_json::json!({"status": "DRAFT"});
        let h1 = compute_entry_hash(None, "BATCH_CREATED", "BATCH", Id::new_v4(), &state, now);
        let h2 = compute_entry_hash(
            Some("different"),
            "BATCH_CREATED",
            "BATCH",
            Id::new_v4(),
            &state,
            now,
        );
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_is_deterministic_for_identical_input() {
        let now = Utc::now();
        let id = Id::new_v4();
        let state = serde_json::json!({"status": "DRAFT"});
        let h1 = compute_entry_hash(None, "BATCH_CREATED", "BATCH", id, &state, now);
        let h2 = compute_entry_hash(None, "BATCH_CREATED", "BATCH", id, &state, now);
        assert_eq!(h1, h2);
    }
}
