//! Domain structs shared by the store, the services and API consumers.
//!
//! Counters are `i64` to match `PostgreSQL` `BIGINT` columns. Read models
//! (`UserProfile`, `Post`, `Comment`) carry viewer-dependent flags such as
//! `me`, `mine`, `following` and `liked`; those are computed per request and
//! are never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{CommentId, PostId, TimelineItemId, UserId};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Minimal public identity of a user, attached to posts and comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct User {
    /// User identifier.
    pub id: UserId,
    /// Unique handle.
    pub username: String,
    /// Avatar reference, if the user uploaded one.
    pub avatar_url: Option<String>,
}

/// Full profile of a user as seen by a (possibly anonymous) viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct UserProfile {
    /// User identifier. Only present on the viewer's own profile.
    pub id: Option<UserId>,
    /// Email address. Only present on the viewer's own profile.
    pub email: Option<String>,
    /// Unique handle.
    pub username: String,
    /// Avatar reference, if any.
    pub avatar_url: Option<String>,
    /// Number of users following this user.
    pub followers_count: i64,
    /// Number of users this user follows.
    pub followees_count: i64,
    /// Whether this profile belongs to the viewer.
    pub me: bool,
    /// Whether the viewer follows this user.
    pub following: bool,
    /// Whether this user follows the viewer.
    pub followed: bool,
}

impl UserProfile {
    /// Strip private fields unless the profile belongs to the viewer.
    #[must_use]
    pub fn redacted(mut self) -> Self {
        if !self.me {
            self.id = None;
            self.email = None;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Posts and timeline
// ---------------------------------------------------------------------------

/// Input for creating a post, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NewPost {
    /// Post body. Trimmed; must be 1 to 480 characters.
    pub content: String,
    /// Optional spoiler label. Trimmed; must be 1 to 64 characters.
    pub spoiler_of: Option<String>,
    /// Whether the post is flagged as not safe for work.
    pub nsfw: bool,
}

/// A post as returned to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Post {
    /// Post identifier.
    pub id: PostId,
    /// Author identifier.
    pub user_id: UserId,
    /// Post body.
    pub content: String,
    /// Spoiler label, if any.
    pub spoiler_of: Option<String>,
    /// Not-safe-for-work flag.
    pub nsfw: bool,
    /// Denormalized number of likes.
    pub likes_count: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Author's public identity, when loaded.
    pub user: Option<User>,
    /// Whether the viewer is the author.
    pub mine: bool,
    /// Whether the viewer likes this post.
    pub liked: bool,
}

/// One post placed in one user's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TimelineItem {
    /// Timeline entry identifier.
    pub id: TimelineItemId,
    /// Owner of the feed this entry belongs to.
    pub user_id: UserId,
    /// Referenced post.
    pub post_id: PostId,
    /// Post payload.
    pub post: Post,
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Comment {
    /// Comment identifier.
    pub id: CommentId,
    /// Author identifier.
    pub user_id: UserId,
    /// Post the comment belongs to.
    pub post_id: PostId,
    /// Comment body.
    pub content: String,
    /// Denormalized number of likes.
    pub likes_count: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Author's public identity, when loaded.
    pub user: Option<User>,
    /// Whether the viewer is the author.
    pub mine: bool,
}

// ---------------------------------------------------------------------------
// Toggle results
// ---------------------------------------------------------------------------

/// Result of toggling a follow relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ToggleFollowOutput {
    /// `true` when the actor now follows the target.
    pub following: bool,
    /// Target's follower count after the toggle.
    pub followers_count: i64,
}

/// Result of toggling a like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ToggleLikeOutput {
    /// `true` when the actor now likes the post.
    pub liked: bool,
    /// Post's like count after the toggle.
    pub likes_count: i64,
}
