use crate::error::WorkflowError;
use crate::types::{Id, OperationName};
use serde::Serialize;
use sqlx::{Postgres, Row, Transaction};

/// A previously recorded mutation outcome, returned verbatim on replay.
#[derive(Debug, Clone)]
pub struct RecordedOutcome {
    pub target_id: Id,
    pub response_code: i32,
    pub payload_fingerprint: String,
}

/// Deterministic content hash of a normalized mutation payload, used to
/// distinguish "same key, same call" (safe replay) from "same key, different
/// call" (a `Conflict`), without re-parsing or re-comparing the original
/// request structurally.
pub fn fingerprint(payload: &impl Serialize) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// `lookup(key, op)` — read-only, outside any write transaction, so the
/// workflow service can short-circuit before opening one.
pub async fn lookup(
    pool: &sqlx::PgPool,
    key: &str,
    operation: OperationName,
) -> Result<Option<RecordedOutcome>, WorkflowError> {
    let row = sqlx::query(
        r#"
        SELECT target_id, response_code, payload_fingerprint
        FROM idempotency_keys
        WHERE key = $1 AND operation = $2
        "#,
    )
    .bind(key)
    .bind(operation.as_str())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(RecordedOutcome {
        target_id: row.try_get("target_id")?,
        response_code: row.try_get("response_code")?,
        payload_fingerprint: row.try_get("payload_fingerprint")?,
    }))
}

/// `record(key, op, object-id, code)` — called inside the same transaction
/// as the mutation's write, after the audit entry (§4.6), so that commit
/// atomicity gives "exactly-once side effect" semantics: either both the
/// mutation, its audit row, and this record exist, or none do.
///
/// The unique constraint on `(key, operation)` is the backstop for a race
/// between two callers presenting the same key concurrently; whichever
/// commits first wins, the other's insert fails with a uniqueness violation
/// which `WorkflowError::from(sqlx::Error)` maps to `Conflict`.
pub async fn record(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
    operation: OperationName,
    target_id: Id,
    response_code: i32,
    payload_fingerprint: &str,
) -> Result<(), WorkflowError> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, operation, target_id, response_code, payload_fingerprint, created_at)
        VALUES ($1, $2, $3, $4, $5, now())
        "#,
    )
    .bind(key)
    .bind(operation.as_str())
    .bind(target_id)
    .bind(response_code)
    .bind(payload_fingerprint)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Helper used by every mutating workflow operation: look up a prior
/// outcome and, if the caller's payload fingerprint differs from what was
/// recorded, raise `Conflict` before any business logic runs.
pub async fn check_replay(
    pool: &sqlx::PgPool,
    key: &str,
    operation: OperationName,
    payload: &impl Serialize,
) -> Result<ReplayDecision, WorkflowError> {
    let this_fingerprint = fingerprint(payload);
    match lookup(pool, key, operation).await? {
        None => Ok(ReplayDecision::FirstAttempt {
            fingerprint: this_fingerprint,
        }),
        Some(existing) if existing.payload_fingerprint == this_fingerprint => {
            Ok(ReplayDecision::Replay(existing))
        }
        Some(_) => Err(WorkflowError::Conflict(format!(
            "idempotency key '{key}' reused for operation '{}' with a different payload",
            operation.as_str()
        ))),
    }
}

pub enum ReplayDecision {
    FirstAttempt { fingerprint: String },
    Replay(RecordedOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_payload() {
        let a = serde_json::json!({"title": "B1"});
        let b = serde_json::json!({"title": "B1"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_for_different_payload() {
        let a = serde_json::json!({"title": "B1"});
        let b = serde_json::json!({"title": "B2"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
