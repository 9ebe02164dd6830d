use crate::error::WorkflowError;
use crate::types::{Id, SoaSource, SoaVersion};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};

fn source_str(source: SoaSource) -> &'static str {
    match source {
        SoaSource::Upload => "UPLOAD",
        SoaSource::Generated => "GENERATED",
    }
}

fn row_to_soa(row: &sqlx::postgres::PgRow) -> Result<SoaVersion, WorkflowError> {
    let source: String = row.try_get("source")?;
    Ok(SoaVersion {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        version_number: row.try_get("version_number")?,
        document_reference: row.try_get("document_reference")?,
        source: match source.as_str() {
            "UPLOAD" => SoaSource::Upload,
            "GENERATED" => SoaSource::Generated,
            other => {
                return Err(WorkflowError::internal(anyhow::anyhow!(
                    "bad soa source '{other}'"
                )))
            }
        },
        uploaded_at: row.try_get("uploaded_at")?,
        uploaded_by: row.try_get("uploaded_by")?,
    })
}

/// Computes `next_version = max(existing.version_number) + 1 OR 1` and
/// inserts the new row, all under the caller's lock on the parent request.
/// The composite uniqueness constraint `(request_id, version_number)` is the
/// backstop: even if two callers raced past the `MAX` read (they can't, the
/// request row is locked for the duration), only one insert would succeed.
pub async fn insert_version(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Id,
    document_reference: &str,
    source: SoaSource,
    uploaded_by: Option<Id>,
    now: DateTime<Utc>,
) -> Result<SoaVersion, WorkflowError> {
    let next_version: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM soa_versions WHERE request_id = $1",
    )
    .bind(request_id)
    .fetch_one(&mut **tx)
    .await?;

    let id = Id::new_v4();
    sqlx::query(
        r#"INSERT INTO soa_versions (id, request_id, version_number, document_reference, source, uploaded_at, uploaded_by)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(id)
    .bind(request_id)
    .bind(next_version)
    .bind(document_reference)
    .bind(source_str(source))
    .bind(now)
    .bind(uploaded_by)
    .execute(&mut **tx)
    .await?;

    Ok(SoaVersion {
        id,
        request_id,
        version_number: next_version,
        document_reference: document_reference.to_string(),
        source,
        uploaded_at: now,
        uploaded_by,
    })
}

pub async fn any_generated_exists_for_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: Id,
) -> Result<bool, WorkflowError> {
    let exists: bool = sqlx::query_scalar(
        r#"SELECT EXISTS (
             SELECT 1 FROM soa_versions sv
             JOIN payment_requests pr ON pr.id = sv.request_id
             WHERE pr.batch_id = $1 AND sv.source = 'GENERATED'
           )"#,
    )
    .bind(batch_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(exists)
}

pub async fn list_versions_for_request(
    pool: &sqlx::PgPool,
    request_id: Id,
) -> Result<Vec<SoaVersion>, WorkflowError> {
    let rows = sqlx::query(
        r#"SELECT id, request_id, version_number, document_reference, source, uploaded_at, uploaded_by
           FROM soa_versions WHERE request_id = $1 ORDER BY version_number ASC"#,
    )
    .bind(request_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_soa).collect()
}
