//! Error type surfaced to the request layer.
//!
//! Storage failures are wrapped, never flattened into strings, so logs keep
//! the full chain. [`SocialError::public_message`] is what a client sees.

use murmur_db::DbError;

/// Errors returned by [`SocialService`](crate::SocialService) operations.
#[derive(Debug, thiserror::Error)]
pub enum SocialError {
    /// The input was rejected before touching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced user, post or comment does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A concurrent transaction won a race; retrying may succeed.
    #[error("conflicting concurrent update: {0}")]
    Conflict(#[source] DbError),

    /// The store failed, including errors building a query.
    #[error("store error: {0}")]
    Store(#[source] DbError),
}

impl SocialError {
    /// Shorthand for a [`SocialError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller sent something wrong.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Whether retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Message safe to show to a client. Never includes storage details.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Conflict(_) => String::from("conflicting update, please retry"),
            Self::Store(_) => String::from("internal error"),
        }
    }
}

impl From<DbError> for SocialError {
    fn from(err: DbError) -> Self {
        if err.is_conflict() {
            Self::Conflict(err)
        } else {
            Self::Store(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_their_detail() {
        let err = SocialError::from(DbError::ForeignKeyViolation(String::from(
            "posts_user_id_fkey",
        )));
        assert!(matches!(err, SocialError::Store(_)));
        assert_eq!(err.public_message(), "internal error");
        assert!(err.to_string().contains("posts_user_id_fkey"));
    }

    #[test]
    fn contention_becomes_a_transient_conflict() {
        let err = SocialError::from(DbError::Serialization(String::from("deadlock")));
        assert!(err.is_transient());
        assert!(!err.is_client_error());
        assert!(!err.public_message().contains("deadlock"));
    }

    #[test]
    fn client_errors_are_reported_verbatim() {
        let err = SocialError::validation("content too long");
        assert!(err.is_client_error());
        assert_eq!(err.public_message(), "content too long");
        assert_eq!(SocialError::NotFound("post").public_message(), "post not found");
    }
}
