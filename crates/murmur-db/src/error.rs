//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`]. Database errors from [`sqlx`]
//! are classified by SQLSTATE so callers can tell contention (retryable)
//! from integrity failures and everything else.

use murmur_query::QueryError;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `foreign_key_violation`.
const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE for `check_violation`.
const CHECK_VIOLATION: &str = "23514";
/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A query could not be built from its template.
    #[error("query build error: {0}")]
    Query(#[from] QueryError),

    /// An insert collided with an existing unique key.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// A referenced row does not exist.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// A row failed a `CHECK` constraint (for example a negative counter).
    #[error("check violation: {0}")]
    CheckViolation(String),

    /// The transaction lost a serialization or deadlock race.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether the error came from contention with a concurrent
    /// transaction, so retrying the whole transaction may succeed.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::UniqueViolation(_) | Self::Serialization(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let classified = match &err {
            sqlx::Error::Database(db) => {
                let detail = db
                    .constraint()
                    .map_or_else(|| db.message().to_owned(), str::to_owned);
                match db.code().as_deref() {
                    Some(UNIQUE_VIOLATION) => Some(Self::UniqueViolation(detail)),
                    Some(FOREIGN_KEY_VIOLATION) => Some(Self::ForeignKeyViolation(detail)),
                    Some(CHECK_VIOLATION) => Some(Self::CheckViolation(detail)),
                    Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => {
                        Some(Self::Serialization(detail))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        classified.unwrap_or(Self::Postgres(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_a_conflict() {
        assert!(DbError::UniqueViolation(String::from("follows_pkey")).is_conflict());
        assert!(DbError::Serialization(String::from("deadlock")).is_conflict());
        assert!(!DbError::ForeignKeyViolation(String::from("posts_user_id_fkey")).is_conflict());
        assert!(!DbError::CheckViolation(String::from("users_followers_count_check")).is_conflict());
        assert!(!DbError::Postgres(sqlx::Error::PoolTimedOut).is_conflict());
    }

    #[test]
    fn non_database_sqlx_errors_stay_postgres_errors() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Postgres(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn query_errors_convert() {
        let err = DbError::from(QueryError::MissingArgument(String::from("id")));
        assert!(err.to_string().contains("@id"));
    }
}
