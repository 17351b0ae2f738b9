//! Row shapes returned by the `PostgreSQL` templates and their conversion
//! into domain models.

use chrono::{DateTime, Utc};
use murmur_types::{Comment, Post, TimelineItem, User, UserId, UserProfile};
use uuid::Uuid;

use crate::store::{PostCounterDrift, UserCounterDrift, UserCounters};

/// `users` identity columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id.into(),
            username: row.username,
            avatar_url: row.avatar_url,
        }
    }
}

/// A user's counter columns.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub(crate) struct CountersRow {
    pub id: Uuid,
    pub followers_count: i64,
    pub followees_count: i64,
}

impl From<CountersRow> for UserCounters {
    fn from(row: CountersRow) -> Self {
        Self {
            id: row.id.into(),
            followers_count: row.followers_count,
            followees_count: row.followees_count,
        }
    }
}

/// Profile columns plus viewer-relative follow flags.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProfileRow {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub followers_count: i64,
    pub followees_count: i64,
    pub following: bool,
    pub followed: bool,
}

impl ProfileRow {
    pub(crate) fn into_profile(self, viewer: Option<UserId>) -> UserProfile {
        let id = UserId::from(self.id);
        UserProfile {
            id: Some(id),
            email: Some(self.email),
            username: self.username,
            avatar_url: self.avatar_url,
            followers_count: self.followers_count,
            followees_count: self.followees_count,
            me: viewer == Some(id),
            following: self.following,
            followed: self.followed,
        }
    }
}

/// Post columns joined with the author's identity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub spoiler_of: Option<String>,
    pub nsfw: bool,
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
    pub username: String,
    pub avatar_url: Option<String>,
    pub liked: bool,
}

impl PostRow {
    pub(crate) fn into_post(self, viewer: Option<UserId>) -> Post {
        let user_id = UserId::from(self.user_id);
        Post {
            id: self.id.into(),
            user_id,
            content: self.content,
            spoiler_of: self.spoiler_of,
            nsfw: self.nsfw,
            likes_count: self.likes_count,
            created_at: self.created_at,
            user: Some(User {
                id: user_id,
                username: self.username,
                avatar_url: self.avatar_url,
            }),
            mine: viewer == Some(user_id),
            liked: self.liked,
        }
    }
}

/// A timeline entry joined with its post.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TimelineRow {
    pub timeline_id: Uuid,
    pub owner_id: Uuid,
    #[sqlx(flatten)]
    pub post: PostRow,
}

impl TimelineRow {
    pub(crate) fn into_item(self) -> TimelineItem {
        let owner = UserId::from(self.owner_id);
        let post = self.post.into_post(Some(owner));
        TimelineItem {
            id: self.timeline_id.into(),
            user_id: owner,
            post_id: post.id,
            post,
        }
    }
}

/// Comment columns joined with the author's identity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CommentRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub content: String,
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl CommentRow {
    pub(crate) fn into_comment(self, viewer: Option<UserId>) -> Comment {
        let user_id = UserId::from(self.user_id);
        Comment {
            id: self.id.into(),
            user_id,
            post_id: self.post_id.into(),
            content: self.content,
            likes_count: self.likes_count,
            created_at: self.created_at,
            user: Some(User {
                id: user_id,
                username: self.username,
                avatar_url: self.avatar_url,
            }),
            mine: viewer == Some(user_id),
        }
    }
}

/// A user whose counters disagree with the `follows` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct UserDriftRow {
    pub user_id: Uuid,
    pub followers_count: i64,
    pub followees_count: i64,
    pub actual_followers: i64,
    pub actual_followees: i64,
}

impl From<UserDriftRow> for UserCounterDrift {
    fn from(row: UserDriftRow) -> Self {
        Self {
            user_id: row.user_id.into(),
            followers_count: row.followers_count,
            actual_followers: row.actual_followers,
            followees_count: row.followees_count,
            actual_followees: row.actual_followees,
        }
    }
}

/// A post whose like counter disagrees with the `post_likes` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PostDriftRow {
    pub post_id: Uuid,
    pub likes_count: i64,
    pub actual_likes: i64,
}

impl From<PostDriftRow> for PostCounterDrift {
    fn from(row: PostDriftRow) -> Self {
        Self {
            post_id: row.post_id.into(),
            likes_count: row.likes_count,
            actual_likes: row.actual_likes,
        }
    }
}
