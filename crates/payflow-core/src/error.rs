use thiserror::Error;

/// The stable set of failure kinds a workflow operation can raise.
///
/// The surface layer (outside this crate) maps each kind to an HTTP status;
/// this crate never knows about HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InvalidState,
    NotFound,
    Forbidden,
    PreconditionFailed,
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn concurrent_modification() -> Self {
        Self::InvalidState("concurrent modification".to_string())
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} '{id}' not found"))
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

/// Raw `sqlx::Error` is never returned directly to a caller; the repository
/// boundary converts it here. Named-constraint violations become the specific
/// kind they represent, everything else becomes `Internal`.
impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::Conflict(format!("uniqueness violation: {}", db_err.message()));
            }
            if db_err.is_check_violation() {
                return Self::Validation(format!("constraint violation: {}", db_err.message()));
            }
        }
        Self::Internal(anyhow::Error::new(err))
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// True for a Postgres-detected deadlock (SQLSTATE 40P01). The workflow
/// service retries such errors at most once rather than surfacing them.
pub fn is_deadlock(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("40P01"),
        _ => false,
    }
}
