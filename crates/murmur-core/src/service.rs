//! The request-facing service.
//!
//! [`SocialService`] validates input, resolves names to ids and delegates
//! to the toggle engine, the store and the fan-out pool. The user, post,
//! comment and audit operations live in their own modules as further
//! `impl SocialService` blocks.

use murmur_db::Store;
use murmur_types::{PostId, ToggleFollowOutput, ToggleLikeOutput, UserId};

use crate::error::SocialError;
use crate::fanout::FanoutHandle;
use crate::toggle::ToggleEngine;
use crate::validate;

/// Entry point for every social operation.
#[derive(Debug, Clone)]
pub struct SocialService {
    pub(crate) store: Store,
    pub(crate) fanout: FanoutHandle,
    toggles: ToggleEngine,
}

impl SocialService {
    /// Create a service over `store`, submitting new posts to `fanout`.
    pub fn new(store: Store, fanout: FanoutHandle) -> Self {
        Self {
            toggles: ToggleEngine::new(store.clone()),
            store,
            fanout,
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// The fan-out submission handle.
    pub const fn fanout(&self) -> &FanoutHandle {
        &self.fanout
    }

    /// Follow `target_username` if `actor` does not follow them yet,
    /// otherwise unfollow.
    ///
    /// # Errors
    ///
    /// - [`SocialError::Validation`] for a malformed username or a
    ///   self-follow; no row is written in either case.
    /// - [`SocialError::NotFound`] if the username does not exist.
    /// - [`SocialError::Conflict`] if a concurrent toggle won twice.
    /// - [`SocialError::Store`] on storage failure.
    pub async fn toggle_follow(
        &self,
        actor: UserId,
        target_username: &str,
    ) -> Result<ToggleFollowOutput, SocialError> {
        let username = validate::username(target_username)?;
        let target = self
            .store
            .user_id_by_username(username)
            .await?
            .ok_or(SocialError::NotFound("user"))?;
        self.toggles.toggle_follow(actor, target).await
    }

    /// Like `post_id` if `actor` has not liked it yet, otherwise unlike.
    ///
    /// # Errors
    ///
    /// - [`SocialError::NotFound`] if the post does not exist.
    /// - [`SocialError::Conflict`] if a concurrent toggle won twice.
    /// - [`SocialError::Store`] on storage failure.
    pub async fn toggle_like(
        &self,
        actor: UserId,
        post_id: PostId,
    ) -> Result<ToggleLikeOutput, SocialError> {
        self.toggles.toggle_like(actor, post_id).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]
pub(crate) mod tests {
    use std::time::Duration;

    use murmur_types::NewPost;
    use tokio::sync::broadcast;

    use super::*;
    use crate::config::FanoutConfig;
    use crate::fanout::{FanoutEvent, FanoutPool};

    /// A memory-backed service with a running fan-out pool.
    pub(crate) fn service() -> (SocialService, FanoutPool) {
        let store = Store::memory();
        let pool = FanoutPool::start(&store, &FanoutConfig::default());
        (SocialService::new(store, pool.handle()), pool)
    }

    pub(crate) async fn register(service: &SocialService, name: &str) -> UserId {
        service
            .create_user(&format!("{name}@example.com"), name)
            .await
            .unwrap()
            .id
    }

    pub(crate) async fn next_delivery(rx: &mut broadcast::Receiver<FanoutEvent>) -> FanoutEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn hello() -> NewPost {
        NewPost {
            content: String::from("hello"),
            ..NewPost::default()
        }
    }

    #[tokio::test]
    async fn follow_by_username_round_trip() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        register(&service, "bob").await;

        let on = service.toggle_follow(ana, "bob").await.unwrap();
        assert!(on.following);
        assert_eq!(on.followers_count, 1);

        let bob = service.user_profile(Some(ana), "bob").await.unwrap();
        assert!(bob.following);
        assert!(!bob.followed);
        assert_eq!(bob.followers_count, 1);

        let off = service.toggle_follow(ana, "bob").await.unwrap();
        assert!(!off.following);
        assert_eq!(off.followers_count, 0);
    }

    #[tokio::test]
    async fn self_follow_is_rejected() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let err = service.toggle_follow(ana, "ana").await.unwrap_err();
        assert!(matches!(err, SocialError::Validation(_)));
        let profile = service.user_profile(Some(ana), "ana").await.unwrap();
        assert_eq!(profile.followers_count, 0);
        assert_eq!(profile.followees_count, 0);
    }

    #[tokio::test]
    async fn follow_target_must_exist_and_be_well_formed() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        assert!(matches!(
            service.toggle_follow(ana, "ghost").await,
            Err(SocialError::NotFound("user"))
        ));
        assert!(matches!(
            service.toggle_follow(ana, "not a name").await,
            Err(SocialError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn hello_reaches_author_and_both_followers() {
        let (service, pool) = service();
        let a = register(&service, "a").await;
        let b = register(&service, "b").await;
        let c = register(&service, "c").await;
        service.toggle_follow(b, "a").await.unwrap();
        service.toggle_follow(c, "a").await.unwrap();
        let mut events = pool.subscribe();

        let item = service.create_post(a, &hello()).await.unwrap();
        assert_eq!(item.user_id, a);
        assert!(item.post.mine);
        let FanoutEvent::Delivered { post_id, items } = next_delivery(&mut events).await else {
            panic!("expected delivery");
        };
        assert_eq!(post_id, item.post_id);
        assert_eq!(items.len(), 2);

        let memory = service.store().as_memory().unwrap();
        assert_eq!(memory.count_timeline_items(item.post_id).await, 3);
        for user in [a, b, c] {
            let feed = service.timeline(user, 0, None).await.unwrap();
            assert_eq!(feed.len(), 1);
            assert_eq!(feed[0].post.content, "hello");
            assert_eq!(feed[0].post_id, item.post_id);
        }
    }

    #[tokio::test]
    async fn like_then_unlike() {
        let (service, _pool) = service();
        let x = register(&service, "x").await;
        let author = register(&service, "author").await;
        let post = service.create_post(author, &hello()).await.unwrap().post_id;

        let on = service.toggle_like(x, post).await.unwrap();
        assert!(on.liked);
        assert_eq!(on.likes_count, 1);
        assert!(service.post(Some(x), post).await.unwrap().liked);

        let off = service.toggle_like(x, post).await.unwrap();
        assert!(!off.liked);
        assert_eq!(off.likes_count, 0);
        assert!(!service.post(Some(x), post).await.unwrap().liked);
    }
}
