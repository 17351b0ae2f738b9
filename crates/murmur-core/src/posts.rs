//! Post creation and post/timeline reads.
//!
//! Creating a post is a single transaction that writes the post and the
//! author's own timeline entry. Followers' entries are written afterwards
//! by the fan-out pool, so a slow or failed fan-out never fails the
//! request that created the post.

use murmur_db::{DbError, Inserted, Page, PostInsert, StoreTx};
use murmur_types::{NewPost, Post, PostId, TimelineItem, TimelineItemId, UserId};

use crate::error::SocialError;
use crate::service::SocialService;
use crate::transaction::settle;
use crate::validate::{self, ValidPost};

impl SocialService {
    /// Publish a post and return the author's own timeline entry for it.
    ///
    /// Fan-out to followers is queued after the commit; a full or closed
    /// queue is logged and does not affect the result.
    ///
    /// # Errors
    ///
    /// - [`SocialError::Validation`] for empty or oversized content or an
    ///   invalid spoiler label.
    /// - [`SocialError::NotFound`] if `actor` does not exist.
    /// - [`SocialError::Store`] on storage failure.
    pub async fn create_post(
        &self,
        actor: UserId,
        input: &NewPost,
    ) -> Result<TimelineItem, SocialError> {
        let valid = validate::post(input)?;
        let mut tx = self.store.begin().await?;
        let result = write_post(&mut tx, actor, &valid).await;
        let (inserted, item_id) = settle(tx, result).await?;

        let post = Post {
            id: inserted.id,
            user_id: actor,
            content: valid.content,
            spoiler_of: valid.spoiler_of,
            nsfw: valid.nsfw,
            likes_count: 0,
            created_at: inserted.created_at,
            user: None,
            mine: true,
            liked: false,
        };
        tracing::debug!(post_id = %post.id, user_id = %actor, "post created");
        if self.fanout.submit(post.clone()).is_err() {
            tracing::debug!(post_id = %post.id, "post saved without follower fan-out");
        }

        Ok(TimelineItem {
            id: item_id,
            user_id: actor,
            post_id: post.id,
            post,
        })
    }

    /// One post as seen by `viewer`.
    ///
    /// # Errors
    ///
    /// [`SocialError::NotFound`] if no such post exists.
    pub async fn post(&self, viewer: Option<UserId>, post_id: PostId) -> Result<Post, SocialError> {
        self.store
            .post(viewer, post_id)
            .await?
            .ok_or(SocialError::NotFound("post"))
    }

    /// Every user's posts, newest first, strictly older than the `before`
    /// cursor when given.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn posts(
        &self,
        viewer: Option<UserId>,
        last: i64,
        before: Option<PostId>,
    ) -> Result<Vec<Post>, SocialError> {
        let page = Page {
            before,
            last: validate::page_size(last),
        };
        Ok(self.store.posts(viewer, page).await?)
    }

    /// Posts written by `username`, newest first, strictly older than the
    /// `before` cursor when given.
    ///
    /// An unknown username yields an empty list.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn posts_by_user(
        &self,
        viewer: Option<UserId>,
        username: &str,
        last: i64,
        before: Option<PostId>,
    ) -> Result<Vec<Post>, SocialError> {
        let page = Page {
            before,
            last: validate::page_size(last),
        };
        Ok(self
            .store
            .posts_by_user(viewer, username.trim(), page)
            .await?)
    }

    /// The actor's feed, newest first.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn timeline(
        &self,
        actor: UserId,
        last: i64,
        before: Option<TimelineItemId>,
    ) -> Result<Vec<TimelineItem>, SocialError> {
        let page = Page {
            before,
            last: validate::page_size(last),
        };
        Ok(self.store.timeline(actor, page).await?)
    }
}

async fn write_post(
    tx: &mut StoreTx,
    actor: UserId,
    valid: &ValidPost,
) -> Result<(Inserted<PostId>, TimelineItemId), SocialError> {
    let inserted = tx
        .insert_post(PostInsert {
            user_id: actor,
            content: &valid.content,
            spoiler_of: valid.spoiler_of.as_deref(),
            nsfw: valid.nsfw,
        })
        .await
        .map_err(|err| match err {
            DbError::ForeignKeyViolation(_) => SocialError::NotFound("user"),
            other => SocialError::from(other),
        })?;
    let item_id = tx.insert_timeline_item(actor, inserted.id).await?;
    Ok((inserted, item_id))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use murmur_db::{FailKind, FailPoint};
    use murmur_types::NewPost;

    use crate::error::SocialError;
    use crate::fanout::FanoutEvent;
    use crate::service::tests::{next_delivery, register, service};
    use crate::validate::MAX_CONTENT_CHARS;

    fn new_post(content: &str) -> NewPost {
        NewPost {
            content: content.to_owned(),
            ..NewPost::default()
        }
    }

    #[tokio::test]
    async fn content_bounds() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;

        let at_limit = "a".repeat(MAX_CONTENT_CHARS);
        assert!(service.create_post(ana, &new_post(&at_limit)).await.is_ok());

        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            service.create_post(ana, &new_post(&over)).await,
            Err(SocialError::Validation(_))
        ));
        assert!(matches!(
            service.create_post(ana, &new_post(" \n\t ")).await,
            Err(SocialError::Validation(_))
        ));
        let posts = service.posts_by_user(Some(ana), "ana", 0, None).await.unwrap();
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn created_post_is_trimmed_and_owned() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let input = NewPost {
            content: String::from("  plot twist  "),
            spoiler_of: Some(String::from(" the film ")),
            nsfw: true,
        };
        let item = service.create_post(ana, &input).await.unwrap();
        assert_eq!(item.post.content, "plot twist");
        assert_eq!(item.post.spoiler_of.as_deref(), Some("the film"));
        assert!(item.post.nsfw);
        assert_eq!(item.post.likes_count, 0);

        let stored = service.post(Some(ana), item.post_id).await.unwrap();
        assert!(stored.mine);
        assert_eq!(stored.user.map(|u| u.username).as_deref(), Some("ana"));
        let anonymous = service.post(None, item.post_id).await.unwrap();
        assert!(!anonymous.mine);
    }

    #[tokio::test]
    async fn unknown_author_is_not_found() {
        let (service, _pool) = service();
        let err = service
            .create_post(murmur_types::UserId::new(), &new_post("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SocialError::NotFound("user")));
    }

    #[tokio::test]
    async fn unknown_post_is_not_found() {
        let (service, _pool) = service();
        assert!(matches!(
            service.post(None, murmur_types::PostId::new()).await,
            Err(SocialError::NotFound("post"))
        ));
    }

    #[tokio::test]
    async fn fan_out_failure_does_not_fail_creation() {
        let (service, pool) = service();
        let ana = register(&service, "ana").await;
        let bob = register(&service, "bob").await;
        service.toggle_follow(bob, "ana").await.unwrap();
        let mut events = pool.subscribe();
        service
            .store()
            .as_memory()
            .unwrap()
            .fail_next(FailPoint::FanOut, FailKind::Unavailable);

        let item = service.create_post(ana, &new_post("hello")).await.unwrap();
        assert!(matches!(
            next_delivery(&mut events).await,
            FanoutEvent::Failed { post_id, .. } if post_id == item.post_id
        ));
        assert_eq!(service.timeline(ana, 0, None).await.unwrap().len(), 1);
        assert!(service.timeline(bob, 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_pool_does_not_fail_creation() {
        let (service, pool) = service();
        let ana = register(&service, "ana").await;
        pool.shutdown().await;

        let item = service.create_post(ana, &new_post("hello")).await.unwrap();
        let feed = service.timeline(ana, 0, None).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id, item.id);
    }

    #[tokio::test]
    async fn posts_page_newest_first_with_cursor() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let mut ids = Vec::new();
        for n in 0..3 {
            let item = service
                .create_post(ana, &new_post(&format!("post {n}")))
                .await
                .unwrap();
            ids.push(item.post_id);
        }

        let first = service.posts_by_user(None, "ana", 2, None).await.unwrap();
        let first_ids: Vec<_> = first.iter().map(|p| p.id).collect();
        assert_eq!(first_ids, [ids[2], ids[1]]);

        let rest = service
            .posts_by_user(None, "ana", 2, Some(ids[1]))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);

        assert!(service.posts_by_user(None, "ghost", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_feed_spans_authors() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let bob = register(&service, "bob").await;
        let first = service.create_post(ana, &new_post("first")).await.unwrap().post_id;
        let second = service.create_post(bob, &new_post("second")).await.unwrap().post_id;
        service.toggle_like(ana, second).await.unwrap();

        let feed = service.posts(Some(ana), 0, None).await.unwrap();
        let ids: Vec<_> = feed.iter().map(|p| p.id).collect();
        assert_eq!(ids, [second, first]);
        assert!(feed[0].liked && !feed[0].mine);
        assert!(!feed[1].liked && feed[1].mine);
        assert_eq!(feed[0].likes_count, 1);

        let older = service.posts(None, 1, Some(second)).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, first);
        assert!(!older[0].mine);
    }
}
