//! Error type for the audit binary.

/// Top-level error for `murmur-audit`.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: murmur_core::config::ConfigError,
    },

    /// Connecting to or migrating the database failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying database error.
        #[from]
        source: murmur_db::DbError,
    },

    /// The audit itself failed.
    #[error("audit error: {source}")]
    Audit {
        /// The underlying service error.
        #[from]
        source: murmur_core::SocialError,
    },

    /// The tracing subscriber could not be installed.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
