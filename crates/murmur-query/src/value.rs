//! Typed, nullable query arguments.
//!
//! A null still carries its SQL type (`Text(None)` binds as a `TEXT` null),
//! so optional columns such as `posts.spoiler_of` bind correctly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A single query argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    /// `BOOLEAN`.
    Bool(Option<bool>),
    /// `BIGINT`.
    Int(Option<i64>),
    /// `TEXT`.
    Text(Option<String>),
    /// `UUID`.
    Uuid(Option<Uuid>),
    /// `TIMESTAMPTZ`.
    Timestamp(Option<DateTime<Utc>>),
}

impl QueryValue {
    /// Whether the value is SQL `NULL`.
    pub const fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Bool(None)
                | Self::Int(None)
                | Self::Text(None)
                | Self::Uuid(None)
                | Self::Timestamp(None)
        )
    }

    /// Convert to a template value for evaluating conditionals.
    ///
    /// Nulls become `none`, so `{% if name %}` is false for them just like
    /// for `false`, `0` and the empty string.
    pub fn to_template_value(&self) -> minijinja::Value {
        match self {
            Self::Bool(Some(b)) => minijinja::Value::from(*b),
            Self::Int(Some(i)) => minijinja::Value::from(*i),
            Self::Text(Some(s)) => minijinja::Value::from(s.as_str()),
            Self::Uuid(Some(u)) => minijinja::Value::from(u.to_string()),
            Self::Timestamp(Some(t)) => minijinja::Value::from(t.to_rfc3339()),
            Self::Bool(None)
            | Self::Int(None)
            | Self::Text(None)
            | Self::Uuid(None)
            | Self::Timestamp(None) => minijinja::Value::from(()),
        }
    }
}

/// Implements `From<T>` and `From<Option<T>>` for a [`QueryValue`] variant.
macro_rules! impl_from {
    ($ty:ty => $variant:ident) => {
        impl From<$ty> for QueryValue {
            fn from(value: $ty) -> Self {
                Self::$variant(Some(value.into()))
            }
        }

        impl From<Option<$ty>> for QueryValue {
            fn from(value: Option<$ty>) -> Self {
                Self::$variant(value.map(Into::into))
            }
        }
    };
}

impl_from!(bool => Bool);
impl_from!(i64 => Int);
impl_from!(i32 => Int);
impl_from!(u32 => Int);
impl_from!(String => Text);
impl_from!(&str => Text);
impl_from!(Uuid => Uuid);
impl_from!(DateTime<Utc> => Timestamp);

/// Named values a template is rendered and bound against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    values: BTreeMap<String, QueryValue>,
}

impl QueryContext {
    /// Create an empty context.
    pub const fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Add a named value, builder style.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<QueryValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a named value.
    pub fn insert(&mut self, name: &str, value: impl Into<QueryValue>) {
        self.values.insert(name.to_owned(), value.into());
    }

    /// Look up a named value.
    pub fn get(&self, name: &str) -> Option<&QueryValue> {
        self.values.get(name)
    }

    /// Number of named values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Template view of the context, used to evaluate conditionals.
    pub(crate) fn to_template_context(&self) -> BTreeMap<&str, minijinja::Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_template_value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_keep_their_type_when_null() {
        assert_eq!(QueryValue::from(None::<String>), QueryValue::Text(None));
        assert_eq!(QueryValue::from(None::<Uuid>), QueryValue::Uuid(None));
        assert!(QueryValue::from(None::<i64>).is_null());
        assert!(!QueryValue::from(0_i64).is_null());
    }

    #[test]
    fn small_integers_widen_to_bigint() {
        assert_eq!(QueryValue::from(7_i32), QueryValue::Int(Some(7)));
        assert_eq!(QueryValue::from(7_u32), QueryValue::Int(Some(7)));
    }

    #[test]
    fn falsy_values_map_to_falsy_template_values() {
        for value in [
            QueryValue::from(false),
            QueryValue::from(0_i64),
            QueryValue::from(""),
            QueryValue::from(None::<Uuid>),
        ] {
            assert!(!value.to_template_value().is_true(), "{value:?} should be falsy");
        }
        assert!(QueryValue::from("x").to_template_value().is_true());
        assert!(QueryValue::from(Uuid::nil()).to_template_value().is_true());
    }

    #[test]
    fn context_builder_replaces_existing_names() {
        let ctx = QueryContext::new().with("a", 1_i64).with("a", 2_i64);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("a"), Some(&QueryValue::Int(Some(2))));
    }
}
