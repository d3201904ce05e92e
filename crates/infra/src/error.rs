//! Storage error model shared by every store trait.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate idempotency key / event id / attempt token |
//! | Database (other) | Any other | `Backend` | Constraint or query errors |
//! | PoolClosed | N/A | `Unavailable` | Connection pool was closed |
//! | PoolTimedOut / Io | N/A | `Unavailable` | Database unreachable; retry later |
//! | Other | N/A | `Backend` | Decode errors, protocol errors, etc. |

use thiserror::Error;

use signpost_core::DomainError;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached; the operation may succeed later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        Self::Backend("lock poisoned".to_string())
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Corrupt(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(format!("json: {value}"))
    }
}

/// Map an SQLx error raised by `operation` into a `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
