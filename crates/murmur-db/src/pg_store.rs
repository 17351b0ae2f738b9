//! `PostgreSQL` implementation of the store.
//!
//! Every statement is a template from [`crate::queries`] built by the
//! [`QueryEngine`] and executed with runtime binds. Statements inside a
//! [`PostgresTx`] run on the transaction's connection in program order.

use chrono::{DateTime, Utc};
use murmur_query::{BuiltQuery, QueryContext, QueryEngine, QueryValue};
use murmur_types::{
    Comment, CommentId, Post, PostId, TimelineItem, TimelineItemId, User, UserId, UserProfile,
};
use sqlx::postgres::PgRow;
use sqlx::{Executor, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::DbError;
use crate::queries;
use crate::rows::{
    CommentRow, CountersRow, PostDriftRow, PostRow, ProfileRow, TimelineRow, UserDriftRow, UserRow,
};
use crate::store::{
    Inserted, Page, PostCounterDrift, PostInsert, RelationDirection, RelationSearch,
    TimelineEntry, UserCounterDrift, UserCounters, UserSearch,
};

/// Binds built arguments, in order, onto a `sqlx` query.
macro_rules! bind_args {
    ($query:expr, $args:expr) => {{
        let mut query = $query;
        for arg in $args {
            query = match arg {
                QueryValue::Bool(v) => query.bind(*v),
                QueryValue::Int(v) => query.bind(*v),
                QueryValue::Text(v) => query.bind(v.clone()),
                QueryValue::Uuid(v) => query.bind(*v),
                QueryValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }};
}

async fn fetch_all<'c, E, T>(executor: E, built: &BuiltQuery) -> Result<Vec<T>, DbError>
where
    E: Executor<'c, Database = Postgres>,
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let query = bind_args!(sqlx::query_as::<_, T>(&built.sql), &built.args);
    Ok(query.fetch_all(executor).await?)
}

async fn fetch_optional<'c, E, T>(executor: E, built: &BuiltQuery) -> Result<Option<T>, DbError>
where
    E: Executor<'c, Database = Postgres>,
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let query = bind_args!(sqlx::query_as::<_, T>(&built.sql), &built.args);
    Ok(query.fetch_optional(executor).await?)
}

async fn fetch_one<'c, E, T>(executor: E, built: &BuiltQuery) -> Result<T, DbError>
where
    E: Executor<'c, Database = Postgres>,
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let query = bind_args!(sqlx::query_as::<_, T>(&built.sql), &built.args);
    Ok(query.fetch_one(executor).await?)
}

/// Run a statement and return the number of rows it touched.
async fn execute<'c, E>(executor: E, built: &BuiltQuery) -> Result<u64, DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = bind_args!(sqlx::query(&built.sql), &built.args);
    Ok(query.execute(executor).await?.rows_affected())
}

/// Escape `ILIKE` wildcards so a search term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn viewer_uuid(viewer: Option<UserId>) -> Option<Uuid> {
    viewer.map(UserId::into_inner)
}

/// Non-transactional `PostgreSQL` operations.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    queries: QueryEngine,
}

impl PostgresStore {
    /// Create a store over a pool with a fresh template cache.
    pub fn new(pool: PgPool) -> Self {
        Self::with_engine(pool, QueryEngine::new())
    }

    /// Create a store over a pool sharing an existing query engine.
    pub const fn with_engine(pool: PgPool, queries: QueryEngine) -> Self {
        Self { pool, queries }
    }

    fn build(&self, text: &str, ctx: &QueryContext) -> Result<BuiltQuery, DbError> {
        Ok(self.queries.build(text, ctx)?)
    }

    pub(crate) async fn begin(&self) -> Result<PostgresTx, DbError> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTx {
            tx,
            queries: self.queries.clone(),
        })
    }

    pub(crate) async fn create_user(&self, email: &str, username: &str) -> Result<User, DbError> {
        let ctx = QueryContext::new()
            .with("email", email)
            .with("username", username);
        let built = self.build(queries::INSERT_USER, &ctx)?;
        let row: UserRow = fetch_one(&self.pool, &built).await?;
        Ok(row.into())
    }

    pub(crate) async fn user_id_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserId>, DbError> {
        let ctx = QueryContext::new().with("username", username);
        let built = self.build(queries::USER_ID_BY_USERNAME, &ctx)?;
        let row: Option<(Uuid,)> = fetch_optional(&self.pool, &built).await?;
        Ok(row.map(|(id,)| id.into()))
    }

    pub(crate) async fn user_by_id(&self, id: UserId) -> Result<Option<User>, DbError> {
        let ctx = QueryContext::new().with("id", id.into_inner());
        let built = self.build(queries::USER_BY_ID, &ctx)?;
        let row: Option<UserRow> = fetch_optional(&self.pool, &built).await?;
        Ok(row.map(User::from))
    }

    pub(crate) async fn user_profile(
        &self,
        viewer: Option<UserId>,
        username: &str,
    ) -> Result<Option<UserProfile>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(viewer))
            .with("username", username);
        let built = self.build(queries::USER_PROFILE, &ctx)?;
        let row: Option<ProfileRow> = fetch_optional(&self.pool, &built).await?;
        Ok(row.map(|r| r.into_profile(viewer)))
    }

    pub(crate) async fn users(&self, search: &UserSearch) -> Result<Vec<UserProfile>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(search.viewer))
            .with("search", search.search.as_deref().map(escape_like))
            .with("after", search.after.clone())
            .with("first", search.first);
        let built = self.build(queries::USERS, &ctx)?;
        let rows: Vec<ProfileRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_profile(search.viewer))
            .collect())
    }

    pub(crate) async fn relations(
        &self,
        search: &RelationSearch,
    ) -> Result<Vec<UserProfile>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(search.viewer))
            .with(
                "followers",
                search.direction == RelationDirection::Followers,
            )
            .with("username", search.username.as_str())
            .with("after", search.after.clone())
            .with("first", search.first);
        let built = self.build(queries::RELATIONS, &ctx)?;
        let rows: Vec<ProfileRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_profile(search.viewer))
            .collect())
    }

    pub(crate) async fn fan_out_post(
        &self,
        post_id: PostId,
        author: UserId,
    ) -> Result<Vec<TimelineEntry>, DbError> {
        let ctx = QueryContext::new()
            .with("post_id", post_id.into_inner())
            .with("author_id", author.into_inner());
        let built = self.build(queries::FAN_OUT_POST, &ctx)?;
        let rows: Vec<(Uuid, Uuid)> = fetch_all(&self.pool, &built).await?;
        Ok(rows
            .into_iter()
            .map(|(id, user_id)| TimelineEntry {
                id: id.into(),
                user_id: user_id.into(),
            })
            .collect())
    }

    pub(crate) async fn post(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
    ) -> Result<Option<Post>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(viewer))
            .with("post_id", post_id.into_inner());
        let built = self.build(queries::POST_BY_ID, &ctx)?;
        let row: Option<PostRow> = fetch_optional(&self.pool, &built).await?;
        Ok(row.map(|r| r.into_post(viewer)))
    }

    pub(crate) async fn posts(
        &self,
        viewer: Option<UserId>,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(viewer))
            .with("before", page.before.map(PostId::into_inner))
            .with("last", page.last);
        let built = self.build(queries::POSTS, &ctx)?;
        let rows: Vec<PostRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(|r| r.into_post(viewer)).collect())
    }

    pub(crate) async fn posts_by_user(
        &self,
        viewer: Option<UserId>,
        username: &str,
        page: Page<PostId>,
    ) -> Result<Vec<Post>, DbError> {
        let ctx = QueryContext::new()
            .with("viewer", viewer_uuid(viewer))
            .with("username", username)
            .with("before", page.before.map(PostId::into_inner))
            .with("last", page.last);
        let built = self.build(queries::POSTS_BY_USER, &ctx)?;
        let rows: Vec<PostRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(|r| r.into_post(viewer)).collect())
    }

    pub(crate) async fn timeline(
        &self,
        owner: UserId,
        page: Page<TimelineItemId>,
    ) -> Result<Vec<TimelineItem>, DbError> {
        let ctx = QueryContext::new()
            .with("owner", owner.into_inner())
            .with("before", page.before.map(TimelineItemId::into_inner))
            .with("last", page.last);
        let built = self.build(queries::TIMELINE, &ctx)?;
        let rows: Vec<TimelineRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(TimelineRow::into_item).collect())
    }

    pub(crate) async fn insert_comment(
        &self,
        user_id: UserId,
        post_id: PostId,
        content: &str,
    ) -> Result<Inserted<CommentId>, DbError> {
        let ctx = QueryContext::new()
            .with("user_id", user_id.into_inner())
            .with("post_id", post_id.into_inner())
            .with("content", content);
        let built = self.build(queries::INSERT_COMMENT, &ctx)?;
        let (id, created_at): (Uuid, DateTime<Utc>) = fetch_one(&self.pool, &built).await?;
        Ok(Inserted {
            id: id.into(),
            created_at,
        })
    }

    pub(crate) async fn comments(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
        page: Page<CommentId>,
    ) -> Result<Vec<Comment>, DbError> {
        let ctx = QueryContext::new()
            .with("post_id", post_id.into_inner())
            .with("before", page.before.map(CommentId::into_inner))
            .with("last", page.last);
        let built = self.build(queries::COMMENTS, &ctx)?;
        let rows: Vec<CommentRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(|r| r.into_comment(viewer)).collect())
    }

    pub(crate) async fn user_counter_drift(&self) -> Result<Vec<UserCounterDrift>, DbError> {
        let built = self.build(queries::USER_COUNTER_DRIFT, &QueryContext::new())?;
        let rows: Vec<UserDriftRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(UserCounterDrift::from).collect())
    }

    pub(crate) async fn post_counter_drift(&self) -> Result<Vec<PostCounterDrift>, DbError> {
        let built = self.build(queries::POST_COUNTER_DRIFT, &QueryContext::new())?;
        let rows: Vec<PostDriftRow> = fetch_all(&self.pool, &built).await?;
        Ok(rows.into_iter().map(PostCounterDrift::from).collect())
    }
}

/// An open `PostgreSQL` transaction.
///
/// Dropping it without committing rolls back when the connection is
/// returned to the pool.
#[derive(Debug)]
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    queries: QueryEngine,
}

impl PostgresTx {
    fn build(&self, text: &str, ctx: &QueryContext) -> Result<BuiltQuery, DbError> {
        Ok(self.queries.build(text, ctx)?)
    }

    pub(crate) async fn lock_user(&mut self, id: UserId) -> Result<Option<UserCounters>, DbError> {
        let ctx = QueryContext::new().with("id", id.into_inner());
        let built = self.build(queries::LOCK_USER, &ctx)?;
        let row: Option<CountersRow> = fetch_optional(&mut *self.tx, &built).await?;
        Ok(row.map(UserCounters::from))
    }

    pub(crate) async fn lock_post(&mut self, id: PostId) -> Result<Option<i64>, DbError> {
        let ctx = QueryContext::new().with("id", id.into_inner());
        let built = self.build(queries::LOCK_POST, &ctx)?;
        let row: Option<(i64,)> = fetch_optional(&mut *self.tx, &built).await?;
        Ok(row.map(|(likes,)| likes))
    }

    #[allow(clippy::similar_names)]
    pub(crate) async fn delete_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        let ctx = follow_context(follower, followee);
        let built = self.build(queries::DELETE_FOLLOW, &ctx)?;
        Ok(execute(&mut *self.tx, &built).await? > 0)
    }

    #[allow(clippy::similar_names)]
    pub(crate) async fn insert_follow(
        &mut self,
        follower: UserId,
        followee: UserId,
    ) -> Result<bool, DbError> {
        let ctx = follow_context(follower, followee);
        let built = self.build(queries::INSERT_FOLLOW, &ctx)?;
        Ok(execute(&mut *self.tx, &built).await? > 0)
    }

    pub(crate) async fn adjust_user_counter(
        &mut self,
        id: UserId,
        followers: bool,
        delta: i64,
    ) -> Result<i64, DbError> {
        let ctx = QueryContext::new()
            .with("followers", followers)
            .with("delta", delta)
            .with("id", id.into_inner());
        let built = self.build(queries::ADJUST_USER_COUNTER, &ctx)?;
        let (count,): (i64,) = fetch_one(&mut *self.tx, &built).await?;
        Ok(count)
    }

    pub(crate) async fn delete_like(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<bool, DbError> {
        let ctx = like_context(user_id, post_id);
        let built = self.build(queries::DELETE_LIKE, &ctx)?;
        Ok(execute(&mut *self.tx, &built).await? > 0)
    }

    pub(crate) async fn insert_like(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<bool, DbError> {
        let ctx = like_context(user_id, post_id);
        let built = self.build(queries::INSERT_LIKE, &ctx)?;
        Ok(execute(&mut *self.tx, &built).await? > 0)
    }

    pub(crate) async fn adjust_likes_count(
        &mut self,
        id: PostId,
        delta: i64,
    ) -> Result<i64, DbError> {
        let ctx = QueryContext::new()
            .with("delta", delta)
            .with("id", id.into_inner());
        let built = self.build(queries::ADJUST_LIKES, &ctx)?;
        let (count,): (i64,) = fetch_one(&mut *self.tx, &built).await?;
        Ok(count)
    }

    pub(crate) async fn insert_post(
        &mut self,
        post: PostInsert<'_>,
    ) -> Result<Inserted<PostId>, DbError> {
        let ctx = QueryContext::new()
            .with("user_id", post.user_id.into_inner())
            .with("content", post.content)
            .with("spoiler_of", post.spoiler_of)
            .with("nsfw", post.nsfw);
        let built = self.build(queries::INSERT_POST, &ctx)?;
        let (id, created_at): (Uuid, DateTime<Utc>) = fetch_one(&mut *self.tx, &built).await?;
        Ok(Inserted {
            id: id.into(),
            created_at,
        })
    }

    pub(crate) async fn insert_timeline_item(
        &mut self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<TimelineItemId, DbError> {
        let ctx = like_context(user_id, post_id);
        let built = self.build(queries::INSERT_TIMELINE_ITEM, &ctx)?;
        let (id,): (Uuid,) = fetch_one(&mut *self.tx, &built).await?;
        Ok(id.into())
    }

    pub(crate) async fn recount_user_counters(
        &mut self,
        id: UserId,
    ) -> Result<Option<UserCounters>, DbError> {
        let ctx = QueryContext::new().with("id", id.into_inner());
        let built = self.build(queries::RECOUNT_USER, &ctx)?;
        let row: Option<CountersRow> = fetch_optional(&mut *self.tx, &built).await?;
        Ok(row.map(UserCounters::from))
    }

    pub(crate) async fn recount_likes(&mut self, id: PostId) -> Result<Option<i64>, DbError> {
        let ctx = QueryContext::new().with("id", id.into_inner());
        let built = self.build(queries::RECOUNT_LIKES, &ctx)?;
        let row: Option<(i64,)> = fetch_optional(&mut *self.tx, &built).await?;
        Ok(row.map(|(likes,)| likes))
    }

    pub(crate) async fn commit(self) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn rollback(self) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[allow(clippy::similar_names)]
fn follow_context(follower: UserId, followee: UserId) -> QueryContext {
    QueryContext::new()
        .with("follower", follower.into_inner())
        .with("followee", followee.into_inner())
}

/// Context for statements keyed by a (user, post) pair.
fn like_context(user_id: UserId, post_id: PostId) -> QueryContext {
    QueryContext::new()
        .with("user_id", user_id.into_inner())
        .with("post_id", post_id.into_inner())
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn every_template_builds_with_its_context() {
        let engine = QueryEngine::new();
        let id = Uuid::now_v7();
        let cases: Vec<(&str, QueryContext)> = vec![
            (queries::LOCK_USER, QueryContext::new().with("id", id)),
            (
                queries::ADJUST_USER_COUNTER,
                QueryContext::new()
                    .with("followers", false)
                    .with("delta", -1_i64)
                    .with("id", id),
            ),
            (
                queries::POSTS_BY_USER,
                QueryContext::new()
                    .with("viewer", None::<Uuid>)
                    .with("username", "ana")
                    .with("before", None::<Uuid>)
                    .with("last", 10_i64),
            ),
            (
                queries::USERS,
                QueryContext::new()
                    .with("viewer", Some(id))
                    .with("search", Some("an"))
                    .with("after", Some("al"))
                    .with("first", 5_i64),
            ),
            (
                queries::RELATIONS,
                QueryContext::new()
                    .with("viewer", None::<Uuid>)
                    .with("followers", true)
                    .with("username", "ana")
                    .with("after", None::<String>)
                    .with("first", 5_i64),
            ),
            (queries::USER_COUNTER_DRIFT, QueryContext::new()),
        ];
        for (text, ctx) in cases {
            let built = engine.build(text, &ctx);
            assert!(built.is_ok(), "failed to build: {text}");
        }
    }

    #[test]
    fn adjust_counter_picks_the_column() {
        let engine = QueryEngine::new();
        let ctx = |followers: bool| {
            QueryContext::new()
                .with("followers", followers)
                .with("delta", 1_i64)
                .with("id", Uuid::nil())
        };
        let followers = engine
            .build(queries::ADJUST_USER_COUNTER, &ctx(true))
            .map(|b| b.sql)
            .unwrap_or_default();
        let followees = engine
            .build(queries::ADJUST_USER_COUNTER, &ctx(false))
            .map(|b| b.sql)
            .unwrap_or_default();
        assert!(followers.contains("SET followers_count = followers_count + $1"));
        assert!(followees.contains("SET followees_count = followees_count + $1"));
        assert!(followees.contains("WHERE id = $2"));
    }

    #[test]
    fn global_posts_filter_only_on_the_cursor() {
        let engine = QueryEngine::new();
        let ctx = |before: Option<Uuid>| {
            QueryContext::new()
                .with("viewer", None::<Uuid>)
                .with("before", before)
                .with("last", 20_i64)
        };
        let Ok(first) = engine.build(queries::POSTS, &ctx(None)) else {
            panic!("posts query failed to build");
        };
        assert!(!first.sql.contains("WHERE"));
        assert!(first.sql.contains("FALSE AS liked"));
        assert_eq!(first.args, vec![QueryValue::Int(Some(20))]);

        let Ok(next) = engine.build(queries::POSTS, &ctx(Some(Uuid::nil()))) else {
            panic!("posts query failed to build");
        };
        assert!(next.sql.contains("WHERE p.id < $1"));
        assert!(next.sql.contains("LIMIT $2"));
    }

    #[test]
    fn users_without_filters_has_no_where_clause() {
        let engine = QueryEngine::new();
        let ctx = QueryContext::new()
            .with("viewer", None::<Uuid>)
            .with("search", None::<String>)
            .with("after", None::<String>)
            .with("first", 10_i64);
        let built = engine.build(queries::USERS, &ctx);
        let Ok(built) = built else {
            panic!("users query failed to build");
        };
        assert!(!built.sql.contains("WHERE"));
        assert!(built.sql.contains("LIMIT $1"));
        assert_eq!(built.args, vec![QueryValue::Int(Some(10))]);
    }
}
