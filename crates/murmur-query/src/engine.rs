//! Query building: render conditionals, then bind `@name` placeholders.
//!
//! ```text
//! raw text --(TemplateCache)--> rendered text --(bind)--> $1..$n + args
//! ```
//!
//! Rendering decides which clauses are present. Binding is mechanical: each
//! distinct `@name` gets the next `$n` marker in order of first appearance,
//! its value is appended once, and every occurrence is replaced. Arguments
//! are never interpolated into the text.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::TemplateCache;
use crate::error::QueryError;
use crate::value::{QueryContext, QueryValue};

/// A final query string and its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    /// Query text with `$1..$n` markers.
    pub sql: String,
    /// Arguments aligned to the markers (`args[0]` binds `$1`).
    pub args: Vec<QueryValue>,
}

/// Builds parameterized queries from conditional templates.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    cache: Arc<TemplateCache>,
}

impl QueryEngine {
    /// Create an engine with its own empty cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(TemplateCache::new()))
    }

    /// Create an engine backed by an existing cache.
    pub const fn with_cache(cache: Arc<TemplateCache>) -> Self {
        Self { cache }
    }

    /// The cache backing this engine.
    pub const fn cache(&self) -> &Arc<TemplateCache> {
        &self.cache
    }

    /// Render `text` against `ctx` and bind its placeholders.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Template`] if `text` does not parse.
    /// - [`QueryError::Execution`] if rendering fails, e.g. a conditional
    ///   names a value missing from `ctx`.
    /// - [`QueryError::MissingArgument`] if a placeholder names a value
    ///   missing from `ctx`.
    pub fn build(&self, text: &str, ctx: &QueryContext) -> Result<BuiltQuery, QueryError> {
        let rendered = self.cache.render(text, &ctx.to_template_context())?;
        let built = bind_placeholders(&rendered, ctx)?;
        tracing::trace!(sql = %built.sql, args = built.args.len(), "built query");
        Ok(built)
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace `@name` tokens with positional markers, left to right.
///
/// A token is `@` followed by `[A-Za-z_][A-Za-z0-9_]*`. Anything else after
/// `@` (for example the `@>` operator) is copied verbatim, as is text inside
/// single-quoted literals.
fn bind_placeholders(rendered: &str, ctx: &QueryContext) -> Result<BuiltQuery, QueryError> {
    let mut sql = String::with_capacity(rendered.len());
    let mut args: Vec<QueryValue> = Vec::new();
    let mut markers: HashMap<&str, usize> = HashMap::new();
    let mut rest = rendered;

    while let Some(pos) = rest.find(['@', '\'']) {
        let (head, tail) = rest.split_at(pos);
        sql.push_str(head);

        if let Some(literal) = tail.strip_prefix('\'') {
            // Doubled quotes ('') close and reopen, which copies them intact.
            if let Some(close) = literal.find('\'') {
                let (body, after) = literal.split_at(close.saturating_add(1));
                sql.push('\'');
                sql.push_str(body);
                rest = after;
            } else {
                // Unterminated literal: copy the remainder verbatim.
                sql.push_str(tail);
                rest = "";
            }
            continue;
        }

        let after_at = tail.strip_prefix('@').unwrap_or(tail);
        let name_len = after_at
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after_at.len());
        let (name, after) = after_at.split_at(name_len);

        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            sql.push('@');
            rest = after_at;
            continue;
        }

        let marker = if let Some(&marker) = markers.get(name) {
            marker
        } else {
            let value = ctx
                .get(name)
                .ok_or_else(|| QueryError::MissingArgument(name.to_owned()))?;
            args.push(value.clone());
            markers.insert(name, args.len());
            args.len()
        };

        sql.push('$');
        sql.push_str(&marker.to_string());
        rest = after;
    }
    sql.push_str(rest);

    Ok(BuiltQuery { sql, args })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const USERS: &str = "SELECT id, username FROM users \
        {% if search or after %}WHERE{% endif %} \
        {% if search %}username ILIKE '%' || @search || '%'{% endif %} \
        {% if search and after %}AND{% endif %} \
        {% if after %}username > @after{% endif %} \
        ORDER BY username LIMIT @first";

    fn users_ctx(search: Option<&str>, after: Option<&str>) -> QueryContext {
        QueryContext::new()
            .with("search", search)
            .with("after", after)
            .with("first", 10_i64)
    }

    fn squash(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn inactive_filters_drop_the_where_clause() {
        let engine = QueryEngine::new();
        let built = engine.build(USERS, &users_ctx(None, None));
        let built = built.ok();
        assert_eq!(
            built.as_ref().map(|b| squash(&b.sql)).as_deref(),
            Some("SELECT id, username FROM users ORDER BY username LIMIT $1")
        );
        assert_eq!(built.map(|b| b.args), Some(vec![QueryValue::Int(Some(10))]));
    }

    #[test]
    fn active_filters_are_joined_and_numbered_in_order() {
        let engine = QueryEngine::new();
        let built = engine.build(USERS, &users_ctx(Some("an"), Some("bob"))).ok();
        assert_eq!(
            built.as_ref().map(|b| squash(&b.sql)).as_deref(),
            Some(
                "SELECT id, username FROM users WHERE username ILIKE '%' || $1 || '%' \
                 AND username > $2 ORDER BY username LIMIT $3"
            )
        );
        assert_eq!(
            built.map(|b| b.args),
            Some(vec![
                QueryValue::from("an"),
                QueryValue::from("bob"),
                QueryValue::Int(Some(10)),
            ])
        );
    }

    #[test]
    fn identical_inputs_build_identical_queries() {
        let ctx = users_ctx(Some("an"), None);
        let first = QueryEngine::new().build(USERS, &ctx).ok();
        let second = QueryEngine::new().build(USERS, &ctx).ok();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn unused_context_entries_contribute_no_argument() {
        let ctx = QueryContext::new()
            .with("id", 5_i64)
            .with("unused", "ignored");
        let built = QueryEngine::new()
            .build("SELECT * FROM posts WHERE id = @id", &ctx)
            .ok();
        assert_eq!(built.map(|b| b.args), Some(vec![QueryValue::Int(Some(5))]));
    }

    #[test]
    fn repeated_name_reuses_one_marker() {
        let viewer = Uuid::now_v7();
        let ctx = QueryContext::new().with("viewer", viewer);
        let built = QueryEngine::new()
            .build(
                "SELECT 1 FROM follows WHERE follower_id = @viewer OR followee_id = @viewer",
                &ctx,
            )
            .ok();
        assert_eq!(
            built.as_ref().map(|b| b.sql.as_str()),
            Some("SELECT 1 FROM follows WHERE follower_id = $1 OR followee_id = $1")
        );
        assert_eq!(built.map(|b| b.args), Some(vec![QueryValue::from(viewer)]));
    }

    #[test]
    fn similar_names_do_not_collide() {
        let ctx = QueryContext::new()
            .with("user", "u")
            .with("user_id", 1_i64);
        let built = QueryEngine::new()
            .build("SELECT @user_id, @user", &ctx)
            .ok();
        assert_eq!(built.as_ref().map(|b| b.sql.as_str()), Some("SELECT $1, $2"));
        assert_eq!(
            built.map(|b| b.args),
            Some(vec![QueryValue::Int(Some(1)), QueryValue::from("u")])
        );
    }

    #[test]
    fn placeholder_missing_from_context_is_an_error() {
        let result = QueryEngine::new().build("SELECT @nope", &QueryContext::new());
        assert!(matches!(result, Err(QueryError::MissingArgument(name)) if name == "nope"));
    }

    #[test]
    fn undefined_control_value_is_an_execution_error() {
        let result = QueryEngine::new().build(
            "SELECT 1 {% if missing %}WHERE x{% endif %}",
            &QueryContext::new(),
        );
        assert!(matches!(result, Err(QueryError::Execution(_))));
    }

    #[test]
    fn literals_and_operators_are_left_alone() {
        let ctx = QueryContext::new().with("tags", "a");
        let built = QueryEngine::new()
            .build(
                "SELECT 'ops@example.com', 'it''s' WHERE tags @> @tags",
                &ctx,
            )
            .ok();
        assert_eq!(
            built.map(|b| b.sql),
            Some(String::from("SELECT 'ops@example.com', 'it''s' WHERE tags @> $1"))
        );
    }

    #[test]
    fn unterminated_literal_is_copied_verbatim() {
        let ctx = QueryContext::new().with("id", 1_i64);
        let built = QueryEngine::new()
            .build("SELECT 1 WHERE id = @id AND note = 'open @id", &ctx)
            .ok();
        assert_eq!(
            built.map(|b| b.sql),
            Some(String::from("SELECT 1 WHERE id = $1 AND note = 'open @id"))
        );
    }

    #[test]
    fn shared_cache_serves_every_engine() {
        let cache = Arc::new(TemplateCache::new());
        let a = QueryEngine::with_cache(Arc::clone(&cache));
        let b = QueryEngine::with_cache(Arc::clone(&cache));
        let ctx = users_ctx(None, None);
        assert!(a.build(USERS, &ctx).is_ok());
        assert!(b.build(USERS, &ctx).is_ok());
        assert_eq!(cache.compiled(), 1);
    }

    #[test]
    fn concurrent_first_use_yields_identical_queries() {
        let engine = QueryEngine::new();
        let ctx = users_ctx(Some("an"), Some("bob"));
        let expected = engine.build(USERS, &ctx).ok();
        let fresh = QueryEngine::new();

        let results: Vec<Option<BuiltQuery>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| fresh.build(USERS, &ctx).ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().ok().flatten())
                .collect()
        });

        assert!(expected.is_some());
        for result in results {
            assert_eq!(result, expected);
        }
        assert!(fresh.cache().compiled() >= 1);
    }
}
