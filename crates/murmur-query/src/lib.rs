//! Conditional, parameterized SQL query templates.
//!
//! Query text may contain `minijinja` conditionals (`{% if search %}...{% endif %}`)
//! evaluated against a [`QueryContext`], and `@name` placeholders that are
//! bound to `PostgreSQL` positional markers (`$1`, `$2`, ...).
//!
//! ```text
//! QueryEngine::build(text, ctx)
//!     |
//!     +-- TemplateCache   compile once per distinct text, render
//!     +-- bind            @name -> $n, ordered argument list
//!     v
//! BuiltQuery { sql, args }
//! ```
//!
//! # Modules
//!
//! - [`cache`] -- [`TemplateCache`], the injectable compiled-template cache
//! - [`engine`] -- [`QueryEngine`] and [`BuiltQuery`]
//! - [`value`] -- [`QueryValue`] and [`QueryContext`]
//! - [`error`] -- [`QueryError`]

pub mod cache;
pub mod engine;
pub mod error;
pub mod value;

pub use cache::TemplateCache;
pub use engine::{BuiltQuery, QueryEngine};
pub use error::QueryError;
pub use value::{QueryContext, QueryValue};
