use crate::error::WorkflowError;
use sqlx::Postgres;

/// Optimistic-concurrency primitive used for every status transition and
/// field update on `PaymentRequest`.
///
/// `query` must be a single `UPDATE … SET …, version = version + 1
/// WHERE id = $1 AND version = $2` statement (the caller supplies the rest
/// of the `SET` clause and any extra bound parameters before calling
/// `.execute`); this helper only interprets the result.
///
/// Returns `Ok(())` when exactly one row was updated. Zero rows affected
/// means either the row doesn't exist or — far more commonly — a concurrent
/// writer already advanced `version`; both collapse to the same
/// `InvalidState("concurrent modification")` the spec requires, since the
/// caller already checked existence before building the query.
pub fn require_single_row(rows_affected: u64) -> Result<(), WorkflowError> {
    match rows_affected {
        1 => Ok(()),
        0 => Err(WorkflowError::concurrent_modification()),
        n => Err(WorkflowError::internal(anyhow::anyhow!(
            "version-gated update touched {n} rows, expected at most 1"
        ))),
    }
}

/// Thin wrapper so call sites read as "update under the version gate" rather
/// than repeating the rows_affected dance inline every time.
pub async fn execute_gated(
    query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    executor: impl sqlx::PgExecutor<'_>,
) -> Result<(), WorkflowError> {
    let result = query.execute(executor).await?;
    require_single_row(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_row_is_ok() {
        assert!(require_single_row(1).is_ok());
    }

    #[test]
    fn zero_rows_is_concurrent_modification() {
        let err = require_single_row(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn more_than_one_row_is_internal_error() {
        let err = require_single_row(2).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
