//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Users, posts, comments and timeline entries each get their own id type so
//! a post id can never be passed where a user id is expected. All ids are
//! UUID v7 (time-ordered), which lets keyset pagination order by id.
//!
//! `PostgreSQL` generates ids via `DEFAULT uuidv7()`. The `new()`
//! constructors exist for the in-memory store and tests.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a registered user.
    UserId
}

define_id! {
    /// Unique identifier for a post.
    PostId
}

define_id! {
    /// Unique identifier for a comment on a post.
    CommentId
}

define_id! {
    /// Unique identifier for a timeline entry (one post in one user's feed).
    TimelineItemId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip_through_uuid() {
        let raw = Uuid::now_v7();
        let user = UserId::from(raw);
        assert_eq!(Uuid::from(user), raw);
        assert_eq!(user.into_inner(), raw);
    }

    #[test]
    fn ids_display_as_plain_uuid() {
        let post = PostId::new();
        assert_eq!(post.to_string(), post.into_inner().to_string());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = TimelineItemId::new();
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, format!("\"{}\"", id.into_inner()));
    }
}
