//! Backend-neutral store handles.
//!
//! [`Store`] and [`StoreTx`] dispatch every operation to either the
//! `PostgreSQL` store or the in-memory store. The services above only see
//! these two types, so the same toggle and fan-out code runs against a live
//! database and in unit tests.
//!
//! ```text
//! Store ----begin()----> StoreTx --commit()/rollback()
//!   |                       |
//!   +-- Postgres            +-- Postgres (sqlx::Transaction)
//!   +-- Memory              +-- Memory   (owned table snapshot)
//! ```

use chrono::{DateTime, Utc};
use murmur_types::{
    Comment, CommentId, Post, PostId, TimelineItem, TimelineItemId, User, UserId, UserProfile,
};

use crate::error::DbError;
use crate::memory::{MemoryStore, MemoryTx};
use crate::pg_store::{PostgresStore, PostgresTx};
use crate::postgres::PostgresPool;

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// A locked user's follow counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserCounters {
    /// User identifier.
    pub id: UserId,
    /// Stored follower count.
    pub followers_count: i64,
    /// Stored followee count.
    pub followees_count: i64,
}

/// Identifier and creation time of a freshly inserted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted<I> {
    /// Generated identifier.
    pub id: I,
    /// Generated creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One timeline entry written by fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Generated timeline entry id.
    pub id: TimelineItemId,
    /// Owner of the feed the entry was written to.
    pub user_id: UserId,
}

/// Columns of a post being inserted.
#[derive(Debug, Clone, Copy)]
pub struct PostInsert<'a> {
    /// Author.
    pub user_id: UserId,
    /// Trimmed body.
    pub content: &'a str,
    /// Trimmed spoiler label.
    pub spoiler_of: Option<&'a str>,
    /// Not-safe-for-work flag.
    pub nsfw: bool,
}

/// A user whose stored follow counters disagree with the `follows` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserCounterDrift {
    /// User identifier.
    pub user_id: UserId,
    /// Stored follower count.
    pub followers_count: i64,
    /// Follower count recomputed from `follows`.
    pub actual_followers: i64,
    /// Stored followee count.
    pub followees_count: i64,
    /// Followee count recomputed from `follows`.
    pub actual_followees: i64,
}

/// A post whose stored like counter disagrees with the `post_likes` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostCounterDrift {
    /// Post identifier.
    pub post_id: PostId,
    /// Stored like count.
    pub likes_count: i64,
    /// Like count recomputed from `post_likes`.
    pub actual_likes: i64,
}

/// Filter for listing users ordered by username.
#[derive(Debug, Clone, Default)]
pub struct UserSearch {
    /// Viewer the follow flags are relative to.
    pub viewer: Option<UserId>,
    /// Case-insensitive username substring.
    pub search: Option<String>,
    /// Only usernames strictly after this one.
    pub after: Option<String>,
    /// Page size (already normalized).
    pub first: i64,
}

/// Which side of the follow graph to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationDirection {
    /// Users following the subject.
    Followers,
    /// Users the subject follows.
    Followees,
}

/// Filter for listing one user's followers or followees.
#[derive(Debug, Clone)]
pub struct RelationSearch {
    /// Viewer the follow flags are relative to.
    pub viewer: Option<UserId>,
    /// Subject of the listing.
    pub username: String,
    /// Followers or followees.
    pub direction: RelationDirection,
    /// Only usernames strictly after this one.
    pub after: Option<String>,
    /// Page size (already normalized).
    pub first: i64,
}

/// Keyset page going backwards from an optional cursor.
#[derive(Debug, Clone, Copy)]
pub struct Page<C> {
    /// Only rows strictly older than this id.
    pub before: Option<C>,
    /// Page size (already normalized).
    pub last: i64,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Forwards a method call to whichever backend the enum holds.
macro_rules! dispatch {
    ($self:expr, $s:ident => $call:expr) => {
        match $self {
            Self::Postgres($s) => $call,
            Self::Memory($s) => $call,
        }
    };
}

/// Handle to a social data store.
///
/// Cheap to clone; both backends share their state behind the clone.
#[derive(Debug, Clone)]
pub enum Store {
    /// `PostgreSQL` via `sqlx`.
    Postgres(PostgresStore),
    /// In-memory tables with the same constraint semantics.
    Memory(MemoryStore),
}

impl Store {
    /// A `PostgreSQL` store over an existing pool.
    pub fn postgres(pool: &PostgresPool) -> Self {
        Self::Postgres(PostgresStore::new(pool.pool().clone()))
    }

    /// An empty in-memory store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// The in-memory backend, if this is one.
    pub const fn as_memory(&self) -> Option<&MemoryStore> {
        match self {
            Self::Memory(store) => Some(store),
            Self::Postgres(_) => None,
        }
    }

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if no connection can be acquired.
    pub async fn begin(&self) -> Result<StoreTx, DbError> {
        Ok(match self {
            Self::Postgres(s) => StoreTx::Postgres(s.begin().await?),
            Self::Memory(s) => StoreTx::Memory(s.begin().await),
        })
    }

    /// Register a user.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UniqueViolation`] if the email or username is taken.
    pub async fn create_user(&self, email: &str, username: &str) -> Result<User, DbError> {
        dispatch!(self, s => s.create_user(email, username).await)
    }

    /// Resolve a username to a user id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    pub async fn user_id_by_username(&self, username: &str) -> Result<Option<UserId>, DbError> {
        dispatch!(self, s => s.user_id_by_username(username).await)
    }

    /// Public identity of one user.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    pub async fn user_by_id(&self, id: UserId) -> Result<Option<User>, DbError> {
        dispatch!(self, s => s.user_by_id(id).await)
    }

    /// One profile as seen by `viewer`, unredacted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    pub async fn user_profile(
        &self,
        viewer: Option<UserId>,
        username: &str,
    ) -> Result<Option<UserProfile>, DbError> {
        dispatch!(self, s => s.user_profile(viewer, username).await)
    }

    /// Profiles ordered by username, unredacted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn users(&self, search: &UserSearch) -> Result<Vec<UserProfile>, DbError> {
        dispatch!(self, s => s.users(search).await)
    }

    /// Followers or followees of a user ordered by username, unredacted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn relations(&self, search: &RelationSearch) -> Result<Vec<UserProfile>, DbError> {
        dispatch!(self, s => s.relations(search).await)
    }

    /// Insert one timeline entry per follower of `author` for `post_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails. No entry is written then.
    pub async fn fan_out_post(
        &self,
        post_id: PostId,
        author: UserId,
    ) -> Result<Vec<TimelineEntry>, DbError> {
        dispatch!(self, s => s.fan_out_post(post_id, author).await)
    }

    /// One post as seen by `viewer`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    pub async fn post(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
    ) -> Result<Option<Post>, DbError> {
        dispatch!(self, s => s.post(viewer, post_id).await)
    }

    /// All posts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn posts(
        &self,
        viewer: Option<UserId>,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        dispatch!(self, s => s.posts(viewer, page).await)
    }

    /// A user's posts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn posts_by_user(
        &self,
        viewer: Option<UserId>,
        username: &str,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        dispatch!(self, s => s.posts_by_user(viewer, username, page).await)
    }

    /// A user's timeline, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn timeline(
        &self,
        owner: UserId,
        page: Page<TimelineItemId>,
    ) -> Result<Vec<TimelineItem>, DbError> {
        dispatch!(self, s => s.timeline(owner, page).await)
    }

    /// Insert a comment.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ForeignKeyViolation`] if the post or user is gone.
    pub async fn insert_comment(
        &self,
        user_id: UserId,
        post_id: PostId,
        content: &str,
    ) -> Result<Inserted<CommentId>, DbError> {
        dispatch!(self, s => s.insert_comment(user_id, post_id, content).await)
    }

    /// Comments on a post, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn comments(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
        page: Page<CommentId>,
    ) -> Result<Vec<Comment>, DbError> {
        dispatch!(self, s => s.comments(viewer, post_id, page).await)
    }

    /// Users whose follow counters disagree with the `follows` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn user_counter_drift(&self) -> Result<Vec<UserCounterDrift>, DbError> {
        dispatch!(self, s => s.user_counter_drift().await)
    }

    /// Posts whose like counter disagrees with the `post_likes` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn post_counter_drift(&self) -> Result<Vec<PostCounterDrift>, DbError> {
        dispatch!(self, s => s.post_counter_drift().await)
    }
}

/// An open transaction on a [`Store`].
///
/// Dropping it without [`commit`](Self::commit) discards every change.
#[derive(Debug)]
pub enum StoreTx {
    /// `PostgreSQL` transaction.
    Postgres(PostgresTx),
    /// In-memory transaction.
    Memory(MemoryTx),
}

impl StoreTx {
    /// Lock a user row until the transaction ends and return its counters.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn lock_user(&mut self, id: UserId) -> Result<Option<UserCounters>, DbError> {
        dispatch!(self, t => t.lock_user(id).await)
    }

    /// Lock a post row until the transaction ends and return its like count.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn lock_post(&mut self, id: PostId) -> Result<Option<i64>, DbError> {
        dispatch!(self, t => t.lock_post(id).await)
    }

    /// Delete a follow, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    #[allow(clippy::similar_names)]
    pub async fn delete_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        dispatch!(self, t => t.delete_follow(follower, followee).await)
    }

    /// Insert a follow, returning whether a row was written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    #[allow(clippy::similar_names)]
    pub async fn insert_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        dispatch!(self, t => t.insert_follow(follower, followee).await)
    }

    /// Shift a user's follower count, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CheckViolation`] if the count would go negative.
    pub async fn adjust_followers_count(&mut self, id: UserId, delta: i64) -> Result<i64, DbError> {
        dispatch!(self, t => t.adjust_user_counter(id, true, delta).await)
    }

    /// Shift a user's followee count, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CheckViolation`] if the count would go negative.
    pub async fn adjust_followees_count(&mut self, id: UserId, delta: i64) -> Result<i64, DbError> {
        dispatch!(self, t => t.adjust_user_counter(id, false, delta).await)
    }

    /// Delete a like, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn delete_like(&mut self, user_id: UserId, post_id: PostId) -> Result<bool, DbError> {
        dispatch!(self, t => t.delete_like(user_id, post_id).await)
    }

    /// Insert a like, returning whether a row was written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn insert_like(&mut self, user_id: UserId, post_id: PostId) -> Result<bool, DbError> {
        dispatch!(self, t => t.insert_like(user_id, post_id).await)
    }

    /// Shift a post's like count, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CheckViolation`] if the count would go negative.
    pub async fn adjust_likes_count(&mut self, id: PostId, delta: i64) -> Result<i64, DbError> {
        dispatch!(self, t => t.adjust_likes_count(id, delta).await)
    }

    /// Insert a post.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ForeignKeyViolation`] if the author does not exist.
    pub async fn insert_post(&mut self, post: PostInsert<'_>) -> Result<Inserted<PostId>, DbError> {
        dispatch!(self, t => t.insert_post(post).await)
    }

    /// Insert one timeline entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ForeignKeyViolation`] if the user or post is gone.
    pub async fn insert_timeline_item(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<TimelineItemId, DbError> {
        dispatch!(self, t => t.insert_timeline_item(user_id, post_id).await)
    }

    /// Rewrite a user's follow counters from the `follows` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn recount_user_counters(
        &mut self,
        id: UserId,
    ) -> Result<Option<UserCounters>, DbError> {
        dispatch!(self, t => t.recount_user_counters(id).await)
    }

    /// Rewrite a post's like counter from the `post_likes` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    pub async fn recount_likes(&mut self, id: PostId) -> Result<Option<i64>, DbError> {
        dispatch!(self, t => t.recount_likes(id).await)
    }

    /// Make every change visible atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the commit fails; nothing is applied then.
    pub async fn commit(self) -> Result<(), DbError> {
        dispatch!(self, t => t.commit().await)
    }

    /// Discard every change.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rollback statement fails.
    pub async fn rollback(self) -> Result<(), DbError> {
        dispatch!(self, t => t.rollback().await)
    }
}
