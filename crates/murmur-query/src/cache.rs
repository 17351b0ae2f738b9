//! Compiled-template cache keyed by raw query text.
//!
//! The cache wraps a `minijinja` [`Environment`] whose loader treats the
//! template *name* as its source, so the raw query text is both the key and
//! the template. `minijinja` serializes loads behind its own lock, which
//! makes concurrent first use of the same text compile it once; every later
//! lookup is a map hit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use minijinja::{AutoEscape, Environment, Error, ErrorKind, UndefinedBehavior};

use crate::error::QueryError;

/// Read-through cache of compiled query templates.
///
/// Owned by a [`QueryEngine`](crate::QueryEngine); share one instance across
/// engines by wrapping it in an [`Arc`] and passing it to
/// [`QueryEngine::with_cache`](crate::QueryEngine::with_cache).
pub struct TemplateCache {
    env: Environment<'static>,
    compiled: Arc<AtomicU64>,
}

impl TemplateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        let compiled = Arc::new(AtomicU64::new(0));
        let mut env = Environment::new();

        // A conditional on a name missing from the context must fail rather
        // than silently drop a clause.
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        // Values reach the database only through placeholders.
        env.set_formatter(|_out, _state, _value| {
            Err(Error::new(
                ErrorKind::InvalidOperation,
                "query templates must bind values with @name placeholders",
            ))
        });

        let counter = Arc::clone(&compiled);
        env.set_loader(move |text| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(Some(text.to_owned()))
        });

        Self { env, compiled }
    }

    /// Number of times a template source was handed to the compiler.
    pub fn compiled(&self) -> u64 {
        self.compiled.load(Ordering::Relaxed)
    }

    /// Compile `text` on first use and render it against `ctx`.
    pub(crate) fn render(
        &self,
        text: &str,
        ctx: &BTreeMap<&str, minijinja::Value>,
    ) -> Result<String, QueryError> {
        let template = self
            .env
            .get_template(text)
            .map_err(|e| QueryError::Template(e.to_string()))?;

        template
            .render(ctx)
            .map_err(|e| QueryError::Execution(e.to_string()))
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("compiled", &self.compiled())
            .finish_non_exhaustive()
    }
}
