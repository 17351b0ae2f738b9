//! In-memory store with `PostgreSQL`-like constraint semantics.
//!
//! Backs unit tests of the services. Tables live behind one async mutex;
//! a [`MemoryTx`] holds that mutex for its whole lifetime and works on a
//! private copy of the tables, which replaces the shared tables only on
//! commit. Transactions are therefore fully serialized, and a dropped or
//! rolled back transaction leaves no trace.
//!
//! Unique keys, foreign keys and `CHECK (count >= 0)` are enforced and
//! reported with the same [`DbError`] variants the `PostgreSQL` store
//! classifies SQLSTATEs into. Failures can be injected with
//! [`MemoryStore::fail_next`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use murmur_types::{
    Comment, CommentId, Post, PostId, TimelineItem, TimelineItemId, User, UserId, UserProfile,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::DbError;
use crate::store::{
    Inserted, Page, PostCounterDrift, PostInsert, RelationDirection, RelationSearch,
    TimelineEntry, UserCounterDrift, UserCounters, UserSearch,
};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// [`StoreTx::insert_follow`](crate::StoreTx::insert_follow).
    InsertFollow,
    /// [`StoreTx::insert_like`](crate::StoreTx::insert_like).
    InsertLike,
    /// [`Store::fan_out_post`](crate::Store::fan_out_post).
    FanOut,
    /// [`Store::user_by_id`](crate::Store::user_by_id).
    UserById,
}

/// Error an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// A unique violation, as from a concurrent insert of the same key.
    Conflict,
    /// The database is unreachable.
    Unavailable,
}

impl FailKind {
    fn into_error(self) -> DbError {
        match self {
            Self::Conflict => DbError::UniqueViolation(String::from("injected conflict")),
            Self::Unavailable => DbError::Postgres(sqlx::Error::PoolTimedOut),
        }
    }
}

type Faults = Arc<StdMutex<VecDeque<(FailPoint, FailKind)>>>;

/// Consume the first pending fault for `point`, if any.
fn check_fault(faults: &Faults, point: FailPoint) -> Result<(), DbError> {
    let mut pending = faults.lock().unwrap_or_else(PoisonError::into_inner);
    let fault = pending
        .iter()
        .position(|(p, _)| *p == point)
        .and_then(|index| pending.remove(index));
    fault.map_or(Ok(()), |(_, kind)| Err(kind.into_error()))
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct UserRecord {
    id: UserId,
    email: String,
    username: String,
    avatar_url: Option<String>,
    followers_count: i64,
    followees_count: i64,
}

#[derive(Debug, Clone)]
struct PostRecord {
    id: PostId,
    user_id: UserId,
    content: String,
    spoiler_of: Option<String>,
    nsfw: bool,
    likes_count: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct TimelineRecord {
    id: TimelineItemId,
    user_id: UserId,
    post_id: PostId,
}

#[derive(Debug, Clone)]
struct CommentRecord {
    id: CommentId,
    user_id: UserId,
    post_id: PostId,
    content: String,
    likes_count: i64,
    created_at: DateTime<Utc>,
}

/// Rows in insertion order; relationship pairs as sets.
#[derive(Debug, Clone, Default)]
struct Tables {
    users: Vec<UserRecord>,
    posts: Vec<PostRecord>,
    /// `(user, post)`.
    likes: BTreeSet<(UserId, PostId)>,
    /// `(follower, followee)`.
    follows: BTreeSet<(UserId, UserId)>,
    timeline: Vec<TimelineRecord>,
    comments: Vec<CommentRecord>,
}

fn to_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn page_len(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Newest-first keyset page over rows kept in insertion order.
///
/// An unknown cursor yields an empty page.
fn page_before<'a, T, C: PartialEq>(
    rows: impl DoubleEndedIterator<Item = &'a T>,
    page: Page<C>,
    key: impl Fn(&T) -> C,
) -> Vec<&'a T>
where
    T: 'a,
{
    let mut newest_first = rows.rev();
    let cursor_missing = page
        .before
        .is_some_and(|cursor| !newest_first.by_ref().any(|row| key(row) == cursor));
    if cursor_missing {
        return Vec::new();
    }
    newest_first.take(page_len(page.last)).collect()
}

fn adjusted(current: i64, delta: i64, constraint: &str) -> Result<i64, DbError> {
    current
        .checked_add(delta)
        .filter(|n| *n >= 0)
        .ok_or_else(|| DbError::CheckViolation(constraint.to_owned()))
}

impl Tables {
    fn user(&self, id: UserId) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.id == id)
    }

    fn user_mut(&mut self, id: UserId) -> Option<&mut UserRecord> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    fn user_named(&self, username: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.username == username)
    }

    fn post(&self, id: PostId) -> Option<&PostRecord> {
        self.posts.iter().find(|p| p.id == id)
    }

    fn post_mut(&mut self, id: PostId) -> Option<&mut PostRecord> {
        self.posts.iter_mut().find(|p| p.id == id)
    }

    fn public_user(&self, id: UserId) -> Option<User> {
        self.user(id).map(|u| User {
            id: u.id,
            username: u.username.clone(),
            avatar_url: u.avatar_url.clone(),
        })
    }

    fn profile(&self, viewer: Option<UserId>, user: &UserRecord) -> UserProfile {
        UserProfile {
            id: Some(user.id),
            email: Some(user.email.clone()),
            username: user.username.clone(),
            avatar_url: user.avatar_url.clone(),
            followers_count: user.followers_count,
            followees_count: user.followees_count,
            me: viewer == Some(user.id),
            following: viewer.is_some_and(|v| self.follows.contains(&(v, user.id))),
            followed: viewer.is_some_and(|v| self.follows.contains(&(user.id, v))),
        }
    }

    fn post_view(&self, viewer: Option<UserId>, post: &PostRecord) -> Post {
        Post {
            id: post.id,
            user_id: post.user_id,
            content: post.content.clone(),
            spoiler_of: post.spoiler_of.clone(),
            nsfw: post.nsfw,
            likes_count: post.likes_count,
            created_at: post.created_at,
            user: self.public_user(post.user_id),
            mine: viewer == Some(post.user_id),
            liked: viewer.is_some_and(|v| self.likes.contains(&(v, post.id))),
        }
    }

    fn profiles_by_username<'a>(
        &self,
        viewer: Option<UserId>,
        candidates: impl Iterator<Item = &'a UserRecord>,
        after: Option<&str>,
        first: i64,
    ) -> Vec<UserProfile> {
        let mut matching: Vec<&UserRecord> = candidates
            .filter(|u| after.is_none_or(|a| u.username.as_str() > a))
            .collect();
        matching.sort_by(|a, b| a.username.cmp(&b.username));
        matching
            .into_iter()
            .take(page_len(first))
            .map(|u| self.profile(viewer, u))
            .collect()
    }

    #[allow(clippy::similar_names)]
    fn recount_user(&mut self, id: UserId) -> Option<UserCounters> {
        let followers = to_count(self.follows.iter().filter(|(_, e)| *e == id).count());
        let followees = to_count(self.follows.iter().filter(|(r, _)| *r == id).count());
        let user = self.user_mut(id)?;
        user.followers_count = followers;
        user.followees_count = followees;
        Some(UserCounters {
            id,
            followers_count: followers,
            followees_count: followees,
        })
    }

    fn recount_post(&mut self, id: PostId) -> Option<i64> {
        let likes = to_count(self.likes.iter().filter(|(_, p)| *p == id).count());
        let post = self.post_mut(id)?;
        post.likes_count = likes;
        Some(likes)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Shared in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Faults,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `point` fail with `kind`.
    ///
    /// Faults queue up; each is consumed by one call.
    pub fn fail_next(&self, point: FailPoint, kind: FailKind) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((point, kind));
    }

    /// Overwrite a user's stored counters, bypassing the toggle path.
    ///
    /// Returns `false` if the user does not exist.
    #[allow(clippy::similar_names)]
    pub async fn overwrite_user_counters(
        &self,
        id: UserId,
        followers_count: i64,
        followees_count: i64,
    ) -> bool {
        let mut tables = self.tables.lock().await;
        tables.user_mut(id).is_some_and(|user| {
            user.followers_count = followers_count;
            user.followees_count = followees_count;
            true
        })
    }

    /// Overwrite a post's stored like counter, bypassing the toggle path.
    ///
    /// Returns `false` if the post does not exist.
    pub async fn overwrite_likes_count(&self, id: PostId, likes_count: i64) -> bool {
        let mut tables = self.tables.lock().await;
        tables.post_mut(id).is_some_and(|post| {
            post.likes_count = likes_count;
            true
        })
    }

    /// Number of timeline entries referencing `post_id`.
    pub async fn count_timeline_items(&self, post_id: PostId) -> usize {
        let tables = self.tables.lock().await;
        tables
            .timeline
            .iter()
            .filter(|t| t.post_id == post_id)
            .count()
    }

    /// Number of stored follow rows.
    pub async fn count_follows(&self) -> usize {
        self.tables.lock().await.follows.len()
    }

    /// Number of stored like rows.
    pub async fn count_likes(&self) -> usize {
        self.tables.lock().await.likes.len()
    }

    pub(crate) async fn begin(&self) -> MemoryTx {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        MemoryTx {
            guard,
            working,
            faults: Arc::clone(&self.faults),
        }
    }

    pub(crate) async fn create_user(&self, email: &str, username: &str) -> Result<User, DbError> {
        let mut tables = self.tables.lock().await;
        if tables.users.iter().any(|u| u.email == email) {
            return Err(DbError::UniqueViolation(String::from("users_email_key")));
        }
        if tables.user_named(username).is_some() {
            return Err(DbError::UniqueViolation(String::from("users_username_key")));
        }
        let record = UserRecord {
            id: UserId::new(),
            email: email.to_owned(),
            username: username.to_owned(),
            avatar_url: None,
            followers_count: 0,
            followees_count: 0,
        };
        let user = User {
            id: record.id,
            username: record.username.clone(),
            avatar_url: None,
        };
        tables.users.push(record);
        Ok(user)
    }

    pub(crate) async fn user_id_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserId>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables.user_named(username).map(|u| u.id))
    }

    pub(crate) async fn user_by_id(&self, id: UserId) -> Result<Option<User>, DbError> {
        check_fault(&self.faults, FailPoint::UserById)?;
        let tables = self.tables.lock().await;
        Ok(tables.public_user(id))
    }

    pub(crate) async fn user_profile(
        &self,
        viewer: Option<UserId>,
        username: &str,
    ) -> Result<Option<UserProfile>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .user_named(username)
            .map(|u| tables.profile(viewer, u)))
    }

    pub(crate) async fn users(&self, search: &UserSearch) -> Result<Vec<UserProfile>, DbError> {
        let tables = self.tables.lock().await;
        let needle = search.search.as_deref().map(str::to_lowercase);
        let candidates = tables.users.iter().filter(|u| {
            needle
                .as_deref()
                .is_none_or(|n| u.username.to_lowercase().contains(n))
        });
        Ok(tables.profiles_by_username(
            search.viewer,
            candidates,
            search.after.as_deref(),
            search.first,
        ))
    }

    pub(crate) async fn relations(
        &self,
        search: &RelationSearch,
    ) -> Result<Vec<UserProfile>, DbError> {
        let tables = self.tables.lock().await;
        let Some(subject) = tables.user_named(&search.username).map(|u| u.id) else {
            return Ok(Vec::new());
        };
        let related: BTreeSet<UserId> = tables
            .follows
            .iter()
            .filter_map(|&(follower, followee)| match search.direction {
                RelationDirection::Followers => (followee == subject).then_some(follower),
                RelationDirection::Followees => (follower == subject).then_some(followee),
            })
            .collect();
        let candidates = tables.users.iter().filter(|u| related.contains(&u.id));
        Ok(tables.profiles_by_username(
            search.viewer,
            candidates,
            search.after.as_deref(),
            search.first,
        ))
    }

    pub(crate) async fn fan_out_post(
        &self,
        post_id: PostId,
        author: UserId,
    ) -> Result<Vec<TimelineEntry>, DbError> {
        check_fault(&self.faults, FailPoint::FanOut)?;
        let mut tables = self.tables.lock().await;
        if tables.post(post_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "timeline_post_id_fkey",
            )));
        }
        let entries: Vec<TimelineEntry> = tables
            .follows
            .iter()
            .filter(|(_, followee)| *followee == author)
            .map(|&(user_id, _)| TimelineEntry {
                id: TimelineItemId::new(),
                user_id,
            })
            .collect();
        tables
            .timeline
            .extend(entries.iter().map(|e| TimelineRecord {
                id: e.id,
                user_id: e.user_id,
                post_id,
            }));
        Ok(entries)
    }

    pub(crate) async fn post(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
    ) -> Result<Option<Post>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables.post(post_id).map(|p| tables.post_view(viewer, p)))
    }

    pub(crate) async fn posts(
        &self,
        viewer: Option<UserId>,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        let tables = self.tables.lock().await;
        Ok(page_before(tables.posts.iter(), page, |p| p.id)
            .into_iter()
            .map(|p| tables.post_view(viewer, p))
            .collect())
    }

    pub(crate) async fn posts_by_user(
        &self,
        viewer: Option<UserId>,
        username: &str,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        let tables = self.tables.lock().await;
        let Some(author) = tables.user_named(username).map(|u| u.id) else {
            return Ok(Vec::new());
        };
        let own = tables.posts.iter().filter(|p| p.user_id == author);
        Ok(page_before(own, page, |p| p.id)
            .into_iter()
            .map(|p| tables.post_view(viewer, p))
            .collect())
    }

    pub(crate) async fn timeline(
        &self,
        owner: UserId,
        page: Page<TimelineItemId>,
    ) -> Result<Vec<TimelineItem>, DbError> {
        let tables = self.tables.lock().await;
        let entries = tables.timeline.iter().filter(|t| t.user_id == owner);
        Ok(page_before(entries, page, |t| t.id)
            .into_iter()
            .filter_map(|t| {
                let post = tables.post(t.post_id)?;
                Some(TimelineItem {
                    id: t.id,
                    user_id: t.user_id,
                    post_id: t.post_id,
                    post: tables.post_view(Some(owner), post),
                })
            })
            .collect())
    }

    pub(crate) async fn insert_comment(
        &self,
        user_id: UserId,
        post_id: PostId,
        content: &str,
    ) -> Result<Inserted<CommentId>, DbError> {
        let mut tables = self.tables.lock().await;
        if tables.user(user_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "comments_user_id_fkey",
            )));
        }
        if tables.post(post_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "comments_post_id_fkey",
            )));
        }
        let inserted = Inserted {
            id: CommentId::new(),
            created_at: Utc::now(),
        };
        tables.comments.push(CommentRecord {
            id: inserted.id,
            user_id,
            post_id,
            content: content.to_owned(),
            likes_count: 0,
            created_at: inserted.created_at,
        });
        Ok(inserted)
    }

    pub(crate) async fn comments(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
        page: Page<CommentId>,
    ) -> Result<Vec<Comment>, DbError> {
        let tables = self.tables.lock().await;
        let on_post = tables.comments.iter().filter(|c| c.post_id == post_id);
        Ok(page_before(on_post, page, |c| c.id)
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                user_id: c.user_id,
                post_id: c.post_id,
                content: c.content.clone(),
                likes_count: c.likes_count,
                created_at: c.created_at,
                user: tables.public_user(c.user_id),
                mine: viewer == Some(c.user_id),
            })
            .collect())
    }

    #[allow(clippy::similar_names)]
    pub(crate) async fn user_counter_drift(&self) -> Result<Vec<UserCounterDrift>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .iter()
            .filter_map(|u| {
                let actual_followers =
                    to_count(tables.follows.iter().filter(|(_, e)| *e == u.id).count());
                let actual_followees =
                    to_count(tables.follows.iter().filter(|(r, _)| *r == u.id).count());
                (u.followers_count != actual_followers || u.followees_count != actual_followees)
                    .then_some(UserCounterDrift {
                        user_id: u.id,
                        followers_count: u.followers_count,
                        actual_followers,
                        followees_count: u.followees_count,
                        actual_followees,
                    })
            })
            .collect())
    }

    pub(crate) async fn post_counter_drift(&self) -> Result<Vec<PostCounterDrift>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .posts
            .iter()
            .filter_map(|p| {
                let actual_likes =
                    to_count(tables.likes.iter().filter(|(_, post)| *post == p.id).count());
                (p.likes_count != actual_likes).then_some(PostCounterDrift {
                    post_id: p.id,
                    likes_count: p.likes_count,
                    actual_likes,
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An open in-memory transaction.
///
/// Holds the table lock until committed, rolled back or dropped.
#[derive(Debug)]
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    faults: Faults,
}

#[allow(clippy::unused_async)]
impl MemoryTx {
    pub(crate) async fn lock_user(&self, id: UserId) -> Result<Option<UserCounters>, DbError> {
        Ok(self.working.user(id).map(|u| UserCounters {
            id: u.id,
            followers_count: u.followers_count,
            followees_count: u.followees_count,
        }))
    }

    pub(crate) async fn lock_post(&self, id: PostId) -> Result<Option<i64>, DbError> {
        Ok(self.working.post(id).map(|p| p.likes_count))
    }

    #[allow(clippy::similar_names)]
    pub(crate) async fn delete_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        Ok(self.working.follows.remove(&(follower, followee)))
    }

    #[allow(clippy::similar_names)]
    pub(crate) async fn insert_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        check_fault(&self.faults, FailPoint::InsertFollow)?;
        if follower == followee {
            return Err(DbError::CheckViolation(String::from("follows_check")));
        }
        if self.working.user(follower).is_none() || self.working.user(followee).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "follows_followee_id_fkey",
            )));
        }
        Ok(self.working.follows.insert((follower, followee)))
    }

    pub(crate) async fn adjust_user_counter(
        &mut self,
        id: UserId,
        followers: bool,
        delta: i64,
    ) -> Result<i64, DbError> {
        let user = self
            .working
            .user_mut(id)
            .ok_or(DbError::Postgres(sqlx::Error::RowNotFound))?;
        if followers {
            user.followers_count =
                adjusted(user.followers_count, delta, "users_followers_count_check")?;
            Ok(user.followers_count)
        } else {
            user.followees_count =
                adjusted(user.followees_count, delta, "users_followees_count_check")?;
            Ok(user.followees_count)
        }
    }

    pub(crate) async fn delete_like(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<bool, DbError> {
        Ok(self.working.likes.remove(&(user_id, post_id)))
    }

    pub(crate) async fn insert_like(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<bool, DbError> {
        check_fault(&self.faults, FailPoint::InsertLike)?;
        if self.working.user(user_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "post_likes_user_id_fkey",
            )));
        }
        if self.working.post(post_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "post_likes_post_id_fkey",
            )));
        }
        Ok(self.working.likes.insert((user_id, post_id)))
    }

    pub(crate) async fn adjust_likes_count(
        &mut self,
        id: PostId,
        delta: i64,
    ) -> Result<i64, DbError> {
        let post = self
            .working
            .post_mut(id)
            .ok_or(DbError::Postgres(sqlx::Error::RowNotFound))?;
        post.likes_count = adjusted(post.likes_count, delta, "posts_likes_count_check")?;
        Ok(post.likes_count)
    }

    pub(crate) async fn insert_post(
        &mut self,
        post: PostInsert<'_>,
    ) -> Result<Inserted<PostId>, DbError> {
        if self.working.user(post.user_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "posts_user_id_fkey",
            )));
        }
        let inserted = Inserted {
            id: PostId::new(),
            created_at: Utc::now(),
        };
        self.working.posts.push(PostRecord {
            id: inserted.id,
            user_id: post.user_id,
            content: post.content.to_owned(),
            spoiler_of: post.spoiler_of.map(str::to_owned),
            nsfw: post.nsfw,
            likes_count: 0,
            created_at: inserted.created_at,
        });
        Ok(inserted)
    }

    pub(crate) async fn insert_timeline_item(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<TimelineItemId, DbError> {
        if self.working.user(user_id).is_none() || self.working.post(post_id).is_none() {
            return Err(DbError::ForeignKeyViolation(String::from(
                "timeline_post_id_fkey",
            )));
        }
        let id = TimelineItemId::new();
        self.working.timeline.push(TimelineRecord {
            id,
            user_id,
            post_id,
        });
        Ok(id)
    }

    pub(crate) async fn recount_user_counters(
        &mut self,
        id: UserId,
    ) -> Result<Option<UserCounters>, DbError> {
        Ok(self.working.recount_user(id))
    }

    pub(crate) async fn recount_likes(&mut self, id: PostId) -> Result<Option<i64>, DbError> {
        Ok(self.working.recount_post(id))
    }

    pub(crate) async fn commit(self) -> Result<(), DbError> {
        let Self {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    pub(crate) async fn rollback(self) -> Result<(), DbError> {
        Ok(())
    }
}
