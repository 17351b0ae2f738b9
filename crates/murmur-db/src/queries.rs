//! SQL templates for every statement the `PostgreSQL` store issues.
//!
//! Templates are compiled once by the [`QueryEngine`](murmur_query::QueryEngine)
//! cache. Every name used in a `{% if %}` must be present in the context
//! (possibly as a null); `@name` placeholders become `$n` parameters.

// ---------------------------------------------------------------------------
// Relationship toggles (transactional)
// ---------------------------------------------------------------------------

/// Lock one user's counter row for the rest of the transaction.
pub const LOCK_USER: &str = r"
SELECT id, followers_count, followees_count
FROM users
WHERE id = @id
FOR UPDATE";

/// Lock one post's counter row for the rest of the transaction.
pub const LOCK_POST: &str = r"
SELECT likes_count
FROM posts
WHERE id = @id
FOR UPDATE";

/// Remove a follow; rows affected tells whether it existed.
pub const DELETE_FOLLOW: &str = r"
DELETE FROM follows
WHERE follower_id = @follower AND followee_id = @followee";

/// Add a follow; rows affected is 0 if it already existed.
pub const INSERT_FOLLOW: &str = r"
INSERT INTO follows (follower_id, followee_id)
VALUES (@follower, @followee)
ON CONFLICT DO NOTHING";

/// Shift one of a user's follow counters by `@delta`.
pub const ADJUST_USER_COUNTER: &str = r"
UPDATE users
SET {% if followers %}followers_count = followers_count{% else %}followees_count = followees_count{% endif %} + @delta
WHERE id = @id
RETURNING {% if followers %}followers_count{% else %}followees_count{% endif %}";

/// Remove a like; rows affected tells whether it existed.
pub const DELETE_LIKE: &str = r"
DELETE FROM post_likes
WHERE user_id = @user_id AND post_id = @post_id";

/// Add a like; rows affected is 0 if it already existed.
pub const INSERT_LIKE: &str = r"
INSERT INTO post_likes (user_id, post_id)
VALUES (@user_id, @post_id)
ON CONFLICT DO NOTHING";

/// Shift a post's like counter by `@delta`.
pub const ADJUST_LIKES: &str = r"
UPDATE posts
SET likes_count = likes_count + @delta
WHERE id = @id
RETURNING likes_count";

// ---------------------------------------------------------------------------
// Posts, timeline and fan-out
// ---------------------------------------------------------------------------

/// Insert a post.
pub const INSERT_POST: &str = r"
INSERT INTO posts (user_id, content, spoiler_of, nsfw)
VALUES (@user_id, @content, @spoiler_of, @nsfw)
RETURNING id, created_at";

/// Insert one timeline entry.
pub const INSERT_TIMELINE_ITEM: &str = r"
INSERT INTO timeline (user_id, post_id)
VALUES (@user_id, @post_id)
RETURNING id";

/// Place a post in the timeline of every follower of its author.
pub const FAN_OUT_POST: &str = r"
INSERT INTO timeline (user_id, post_id)
SELECT follower_id, @post_id
FROM follows
WHERE followee_id = @author_id
RETURNING id, user_id";

/// One post with its author, as seen by `@viewer`.
pub const POST_BY_ID: &str = r"
SELECT p.id, p.user_id, p.content, p.spoiler_of, p.nsfw, p.likes_count, p.created_at,
       u.username, u.avatar_url,
{% if viewer %}
       EXISTS (SELECT 1 FROM post_likes l WHERE l.post_id = p.id AND l.user_id = @viewer) AS liked
{% else %}
       FALSE AS liked
{% endif %}
FROM posts p
INNER JOIN users u ON u.id = p.user_id
WHERE p.id = @post_id";

/// Every post, newest first, before an optional cursor.
pub const POSTS: &str = r"
SELECT p.id, p.user_id, p.content, p.spoiler_of, p.nsfw, p.likes_count, p.created_at,
       u.username, u.avatar_url,
{% if viewer %}
       EXISTS (SELECT 1 FROM post_likes l WHERE l.post_id = p.id AND l.user_id = @viewer) AS liked
{% else %}
       FALSE AS liked
{% endif %}
FROM posts p
INNER JOIN users u ON u.id = p.user_id
{% if before %}WHERE p.id < @before{% endif %}
ORDER BY p.id DESC
LIMIT @last";

/// A user's posts, newest first, before an optional cursor.
pub const POSTS_BY_USER: &str = r"
SELECT p.id, p.user_id, p.content, p.spoiler_of, p.nsfw, p.likes_count, p.created_at,
       u.username, u.avatar_url,
{% if viewer %}
       EXISTS (SELECT 1 FROM post_likes l WHERE l.post_id = p.id AND l.user_id = @viewer) AS liked
{% else %}
       FALSE AS liked
{% endif %}
FROM posts p
INNER JOIN users u ON u.id = p.user_id
WHERE u.username = @username
{% if before %}AND p.id < @before{% endif %}
ORDER BY p.id DESC
LIMIT @last";

/// A user's timeline, newest first, before an optional cursor.
pub const TIMELINE: &str = r"
SELECT t.id AS timeline_id, t.user_id AS owner_id,
       p.id, p.user_id, p.content, p.spoiler_of, p.nsfw, p.likes_count, p.created_at,
       u.username, u.avatar_url,
       EXISTS (SELECT 1 FROM post_likes l WHERE l.post_id = p.id AND l.user_id = @owner) AS liked
FROM timeline t
INNER JOIN posts p ON p.id = t.post_id
INNER JOIN users u ON u.id = p.user_id
WHERE t.user_id = @owner
{% if before %}AND t.id < @before{% endif %}
ORDER BY t.id DESC
LIMIT @last";

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Register a user.
pub const INSERT_USER: &str = r"
INSERT INTO users (email, username)
VALUES (@email, @username)
RETURNING id, username, avatar_url";

/// Resolve a username to an id.
pub const USER_ID_BY_USERNAME: &str = r"
SELECT id FROM users WHERE username = @username";

/// Public identity of one user.
pub const USER_BY_ID: &str = r"
SELECT id, username, avatar_url FROM users WHERE id = @id";

/// One profile, with follow flags relative to `@viewer`.
pub const USER_PROFILE: &str = r"
SELECT u.id, u.email, u.username, u.avatar_url, u.followers_count, u.followees_count
{% if viewer %}
     , followers.follower_id IS NOT NULL AS following
     , followees.followee_id IS NOT NULL AS followed
{% else %}
     , FALSE AS following
     , FALSE AS followed
{% endif %}
FROM users u
{% if viewer %}
LEFT JOIN follows AS followers
    ON followers.follower_id = @viewer AND followers.followee_id = u.id
LEFT JOIN follows AS followees
    ON followees.follower_id = u.id AND followees.followee_id = @viewer
{% endif %}
WHERE u.username = @username";

/// Profiles ordered by username, optionally filtered by a substring and an
/// `@after` username cursor.
pub const USERS: &str = r"
SELECT u.id, u.email, u.username, u.avatar_url, u.followers_count, u.followees_count
{% if viewer %}
     , followers.follower_id IS NOT NULL AS following
     , followees.followee_id IS NOT NULL AS followed
{% else %}
     , FALSE AS following
     , FALSE AS followed
{% endif %}
FROM users u
{% if viewer %}
LEFT JOIN follows AS followers
    ON followers.follower_id = @viewer AND followers.followee_id = u.id
LEFT JOIN follows AS followees
    ON followees.follower_id = u.id AND followees.followee_id = @viewer
{% endif %}
{% if search or after %}WHERE{% endif %}
{% if search %}u.username ILIKE '%' || @search || '%'{% endif %}
{% if search and after %}AND{% endif %}
{% if after %}u.username > @after{% endif %}
ORDER BY u.username ASC
LIMIT @first";

/// Followers (or followees) of `@username`, ordered by username.
pub const RELATIONS: &str = r"
SELECT u.id, u.email, u.username, u.avatar_url, u.followers_count, u.followees_count
{% if viewer %}
     , followers.follower_id IS NOT NULL AS following
     , followees.followee_id IS NOT NULL AS followed
{% else %}
     , FALSE AS following
     , FALSE AS followed
{% endif %}
FROM follows f
INNER JOIN users u ON u.id = {% if followers %}f.follower_id{% else %}f.followee_id{% endif %}
{% if viewer %}
LEFT JOIN follows AS followers
    ON followers.follower_id = @viewer AND followers.followee_id = u.id
LEFT JOIN follows AS followees
    ON followees.follower_id = u.id AND followees.followee_id = @viewer
{% endif %}
WHERE {% if followers %}f.followee_id{% else %}f.follower_id{% endif %} = (SELECT id FROM users WHERE username = @username)
{% if after %}AND u.username > @after{% endif %}
ORDER BY u.username ASC
LIMIT @first";

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

/// Insert a comment.
pub const INSERT_COMMENT: &str = r"
INSERT INTO comments (user_id, post_id, content)
VALUES (@user_id, @post_id, @content)
RETURNING id, created_at";

/// Comments on a post, newest first, before an optional cursor.
pub const COMMENTS: &str = r"
SELECT c.id, c.user_id, c.post_id, c.content, c.likes_count, c.created_at,
       u.username, u.avatar_url
FROM comments c
INNER JOIN users u ON u.id = c.user_id
WHERE c.post_id = @post_id
{% if before %}AND c.id < @before{% endif %}
ORDER BY c.id DESC
LIMIT @last";

// ---------------------------------------------------------------------------
// Counter audit
// ---------------------------------------------------------------------------

/// Users whose stored follow counters disagree with the `follows` table.
pub const USER_COUNTER_DRIFT: &str = r"
SELECT u.id AS user_id, u.followers_count, u.followees_count,
       COALESCE(fr.n, 0) AS actual_followers,
       COALESCE(fe.n, 0) AS actual_followees
FROM users u
LEFT JOIN (SELECT followee_id, count(*) AS n FROM follows GROUP BY followee_id) fr
    ON fr.followee_id = u.id
LEFT JOIN (SELECT follower_id, count(*) AS n FROM follows GROUP BY follower_id) fe
    ON fe.follower_id = u.id
WHERE u.followers_count <> COALESCE(fr.n, 0)
   OR u.followees_count <> COALESCE(fe.n, 0)
ORDER BY u.id";

/// Posts whose stored like counter disagrees with the `post_likes` table.
pub const POST_COUNTER_DRIFT: &str = r"
SELECT p.id AS post_id, p.likes_count, COALESCE(l.n, 0) AS actual_likes
FROM posts p
LEFT JOIN (SELECT post_id, count(*) AS n FROM post_likes GROUP BY post_id) l
    ON l.post_id = p.id
WHERE p.likes_count <> COALESCE(l.n, 0)
ORDER BY p.id";

/// Recompute a user's follow counters from the `follows` table.
pub const RECOUNT_USER: &str = r"
UPDATE users u
SET followers_count = (SELECT count(*) FROM follows WHERE followee_id = u.id),
    followees_count = (SELECT count(*) FROM follows WHERE follower_id = u.id)
WHERE u.id = @id
RETURNING u.id, u.followers_count, u.followees_count";

/// Recompute a post's like counter from the `post_likes` table.
pub const RECOUNT_LIKES: &str = r"
UPDATE posts p
SET likes_count = (SELECT count(*) FROM post_likes WHERE post_id = p.id)
WHERE p.id = @id
RETURNING p.likes_count";
