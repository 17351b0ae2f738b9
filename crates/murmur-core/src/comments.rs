//! Comments on posts.

use murmur_db::{DbError, Page};
use murmur_types::{Comment, CommentId, PostId, UserId};

use crate::error::SocialError;
use crate::service::SocialService;
use crate::validate;

impl SocialService {
    /// Comment on a post as `actor`.
    ///
    /// # Errors
    ///
    /// - [`SocialError::Validation`] for empty or oversized content.
    /// - [`SocialError::NotFound`] if the post or the actor does not exist.
    /// - [`SocialError::Store`] on storage failure.
    pub async fn create_comment(
        &self,
        actor: UserId,
        post_id: PostId,
        content: &str,
    ) -> Result<Comment, SocialError> {
        let content = validate::content(content)?;
        let inserted = self
            .store
            .insert_comment(actor, post_id, content)
            .await
            .map_err(|err| match err {
                DbError::ForeignKeyViolation(constraint) if constraint.contains("post_id") => {
                    SocialError::NotFound("post")
                }
                DbError::ForeignKeyViolation(_) => SocialError::NotFound("user"),
                other => SocialError::from(other),
            })?;
        let user = self.user_by_id(actor).await?;
        tracing::debug!(comment_id = %inserted.id, %post_id, "comment created");

        Ok(Comment {
            id: inserted.id,
            user_id: actor,
            post_id,
            content: content.to_owned(),
            likes_count: 0,
            created_at: inserted.created_at,
            user: Some(user),
            mine: true,
        })
    }

    /// Comments on a post, newest first.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn comments(
        &self,
        viewer: Option<UserId>,
        post_id: PostId,
        last: i64,
        before: Option<CommentId>,
    ) -> Result<Vec<Comment>, SocialError> {
        let page = Page {
            before,
            last: validate::page_size(last),
        };
        Ok(self.store.comments(viewer, post_id, page).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use murmur_types::{NewPost, PostId, UserId};

    use crate::error::SocialError;
    use crate::service::tests::{register, service};

    fn new_post() -> NewPost {
        NewPost {
            content: String::from("thoughts?"),
            ..NewPost::default()
        }
    }

    #[tokio::test]
    async fn comment_round_trip() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let bob = register(&service, "bob").await;
        let post = service.create_post(ana, &new_post()).await.unwrap().post_id;

        let comment = service
            .create_comment(bob, post, "  agreed  ")
            .await
            .unwrap();
        assert_eq!(comment.content, "agreed");
        assert!(comment.mine);
        assert_eq!(comment.user.as_ref().map(|u| u.username.as_str()), Some("bob"));

        let listed = service.comments(Some(ana), post, 0, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, comment.id);
        assert!(!listed[0].mine);
    }

    #[tokio::test]
    async fn comments_page_newest_first() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let post = service.create_post(ana, &new_post()).await.unwrap().post_id;
        let mut ids = Vec::new();
        for n in 0..3 {
            let comment = service
                .create_comment(ana, post, &format!("reply {n}"))
                .await
                .unwrap();
            ids.push(comment.id);
        }

        let page = service.comments(None, post, 2, None).await.unwrap();
        let page_ids: Vec<_> = page.iter().map(|c| c.id).collect();
        assert_eq!(page_ids, [ids[2], ids[1]]);
        let rest = service.comments(None, post, 2, Some(ids[1])).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);
    }

    #[tokio::test]
    async fn comment_requires_content_and_targets() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let post = service.create_post(ana, &new_post()).await.unwrap().post_id;

        assert!(matches!(
            service.create_comment(ana, post, "   ").await,
            Err(SocialError::Validation(_))
        ));
        assert!(matches!(
            service.create_comment(ana, PostId::new(), "hi").await,
            Err(SocialError::NotFound("post"))
        ));
        assert!(matches!(
            service.create_comment(UserId::new(), post, "hi").await,
            Err(SocialError::NotFound("user"))
        ));
    }
}
