//! Error types for query construction.
//!
//! Every variant is a programmer error from the caller's point of view: the
//! template text or the context handed to [`QueryEngine::build`] is wrong.
//!
//! [`QueryEngine::build`]: crate::QueryEngine::build

/// Errors that can occur while building a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The raw template text could not be parsed.
    #[error("template error: {0}")]
    Template(String),

    /// Rendering the compiled template against the context failed, e.g. a
    /// conditional references a name missing from the context.
    #[error("execution error: {0}")]
    Execution(String),

    /// The rendered text contains `@name` but the context has no `name`.
    #[error("execution error: no value for placeholder @{0}")]
    MissingArgument(String),
}
