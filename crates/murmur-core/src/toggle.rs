//! Relationship toggles: follow and like.
//!
//! Each toggle flips one `(actor, target)` pair between absent and present
//! and moves the denormalized counters with it, all in one transaction:
//!
//! ```text
//! BEGIN
//!   SELECT ... FOR UPDATE        counter rows (users in id order, or the post)
//!   DELETE pair                  1 row  -> now absent, delta = -1
//!   INSERT pair ON CONFLICT ...  1 row  -> now present, delta = +1
//!   UPDATE counters += delta
//! COMMIT                         (ROLLBACK on any error)
//! ```
//!
//! The row locks serialize toggles touching the same counters, so the
//! delete/insert outcome always reflects the committed state. A unique or
//! serialization failure that slips through is retried once.

use std::future::Future;

use murmur_db::{DbError, Store, StoreTx};
use murmur_types::{PostId, ToggleFollowOutput, ToggleLikeOutput, UserId};

use crate::error::SocialError;
use crate::transaction::settle;

/// How many times a conflicting toggle transaction is re-run.
pub const MAX_CONFLICT_RETRIES: u32 = 1;

/// Runs follow and like toggles against a [`Store`].
#[derive(Debug, Clone)]
pub struct ToggleEngine {
    store: Store,
}

impl ToggleEngine {
    /// Create an engine over `store`.
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Flip whether `actor` follows `target`.
    ///
    /// # Errors
    ///
    /// - [`SocialError::Validation`] if `actor == target`; nothing is written.
    /// - [`SocialError::NotFound`] if either user does not exist.
    /// - [`SocialError::Conflict`] if the retry also lost a race.
    pub async fn toggle_follow(
        &self,
        actor: UserId,
        target: UserId,
    ) -> Result<ToggleFollowOutput, SocialError> {
        if actor == target {
            return Err(SocialError::validation("cannot follow yourself"));
        }
        with_conflict_retry("follow", move || async move {
            let mut tx = self.store.begin().await?;
            let result = follow_in_tx(&mut tx, actor, target).await;
            settle(tx, result).await
        })
        .await
    }

    /// Flip whether `actor` likes `post_id`.
    ///
    /// # Errors
    ///
    /// - [`SocialError::NotFound`] if the post does not exist.
    /// - [`SocialError::Conflict`] if the retry also lost a race.
    pub async fn toggle_like(
        &self,
        actor: UserId,
        post_id: PostId,
    ) -> Result<ToggleLikeOutput, SocialError> {
        with_conflict_retry("like", move || async move {
            let mut tx = self.store.begin().await?;
            let result = like_in_tx(&mut tx, actor, post_id).await;
            settle(tx, result).await
        })
        .await
    }
}

/// Re-run `attempt` while it fails with [`SocialError::Conflict`], at most
/// [`MAX_CONFLICT_RETRIES`] extra times.
async fn with_conflict_retry<T, F, Fut>(op: &'static str, mut attempt: F) -> Result<T, SocialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SocialError>>,
{
    let mut retries = 0_u32;
    loop {
        match attempt().await {
            Err(SocialError::Conflict(err)) if retries < MAX_CONFLICT_RETRIES => {
                retries = retries.saturating_add(1);
                tracing::warn!(op, retries, error = %err, "toggle conflict, retrying");
            }
            other => return other,
        }
    }
}

/// The pair was neither deleted nor inserted, so someone changed it
/// without holding the counter locks.
fn lost_race(what: &str) -> SocialError {
    SocialError::Conflict(DbError::Serialization(format!(
        "{what} changed concurrently"
    )))
}

async fn follow_in_tx(
    tx: &mut StoreTx,
    actor: UserId,
    target: UserId,
) -> Result<ToggleFollowOutput, SocialError> {
    let (first, second) = if actor < target {
        (actor, target)
    } else {
        (target, actor)
    };
    for id in [first, second] {
        if tx.lock_user(id).await?.is_none() {
            return Err(SocialError::NotFound("user"));
        }
    }

    let following = if tx.delete_follow(actor, target).await? {
        false
    } else if tx.insert_follow(actor, target).await? {
        true
    } else {
        return Err(lost_race("follow"));
    };

    let delta = if following { 1 } else { -1 };
    let followers_count = tx.adjust_followers_count(target, delta).await?;
    tx.adjust_followees_count(actor, delta).await?;

    tracing::debug!(
        actor = %actor,
        target = %target,
        following,
        followers_count,
        "follow toggled"
    );
    Ok(ToggleFollowOutput {
        following,
        followers_count,
    })
}

async fn like_in_tx(
    tx: &mut StoreTx,
    actor: UserId,
    post_id: PostId,
) -> Result<ToggleLikeOutput, SocialError> {
    if tx.lock_post(post_id).await?.is_none() {
        return Err(SocialError::NotFound("post"));
    }

    let liked = if tx.delete_like(actor, post_id).await? {
        false
    } else if tx.insert_like(actor, post_id).await? {
        true
    } else {
        return Err(lost_race("like"));
    };

    let delta = if liked { 1 } else { -1 };
    let likes_count = tx.adjust_likes_count(post_id, delta).await?;

    tracing::debug!(actor = %actor, post_id = %post_id, liked, likes_count, "like toggled");
    Ok(ToggleLikeOutput { liked, likes_count })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use murmur_db::{FailKind, FailPoint, PostInsert};
    use proptest::prelude::*;

    use super::*;
    use crate::audit::CounterAudit;

    async fn users(store: &Store, names: &[&str]) -> Vec<UserId> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let user = store
                .create_user(&format!("{name}@example.com"), name)
                .await
                .unwrap();
            ids.push(user.id);
        }
        ids
    }

    async fn post_by(store: &Store, author: UserId) -> PostId {
        let mut tx = store.begin().await.unwrap();
        let post = tx
            .insert_post(PostInsert {
                user_id: author,
                content: "hello",
                spoiler_of: None,
                nsfw: false,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        post.id
    }

    async fn profile_counts(store: &Store, name: &str) -> (i64, i64) {
        let p = store.user_profile(None, name).await.unwrap().unwrap();
        (p.followers_count, p.followees_count)
    }

    #[tokio::test]
    async fn follow_round_trip() {
        let store = Store::memory();
        let ids = users(&store, &["ana", "bob"]).await;
        let engine = ToggleEngine::new(store.clone());

        let on = engine.toggle_follow(ids[0], ids[1]).await.unwrap();
        assert_eq!(
            on,
            ToggleFollowOutput {
                following: true,
                followers_count: 1
            }
        );
        assert_eq!(profile_counts(&store, "ana").await, (0, 1));
        assert_eq!(profile_counts(&store, "bob").await, (1, 0));

        let off = engine.toggle_follow(ids[0], ids[1]).await.unwrap();
        assert_eq!(
            off,
            ToggleFollowOutput {
                following: false,
                followers_count: 0
            }
        );
        assert_eq!(profile_counts(&store, "ana").await, (0, 0));
        assert_eq!(profile_counts(&store, "bob").await, (0, 0));
    }

    #[tokio::test]
    async fn like_round_trip() {
        let store = Store::memory();
        let ids = users(&store, &["x", "author"]).await;
        let post = post_by(&store, ids[1]).await;
        let engine = ToggleEngine::new(store.clone());

        let on = engine.toggle_like(ids[0], post).await.unwrap();
        assert_eq!(
            on,
            ToggleLikeOutput {
                liked: true,
                likes_count: 1
            }
        );
        let viewed = store.post(Some(ids[0]), post).await.unwrap().unwrap();
        assert!(viewed.liked);

        let off = engine.toggle_like(ids[0], post).await.unwrap();
        assert_eq!(
            off,
            ToggleLikeOutput {
                liked: false,
                likes_count: 0
            }
        );
        let viewed = store.post(Some(ids[0]), post).await.unwrap().unwrap();
        assert!(!viewed.liked);
        assert_eq!(viewed.likes_count, 0);
    }

    #[tokio::test]
    async fn self_follow_writes_nothing() {
        let store = Store::memory();
        let ids = users(&store, &["ana"]).await;
        let engine = ToggleEngine::new(store.clone());

        let err = engine.toggle_follow(ids[0], ids[0]).await;
        assert!(matches!(err, Err(SocialError::Validation(_))));
        assert_eq!(profile_counts(&store, "ana").await, (0, 0));
        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_follows().await, 0);
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let store = Store::memory();
        let ids = users(&store, &["ana"]).await;
        let engine = ToggleEngine::new(store.clone());

        let follow = engine.toggle_follow(ids[0], UserId::new()).await;
        assert!(matches!(follow, Err(SocialError::NotFound("user"))));
        let like = engine.toggle_like(ids[0], PostId::new()).await;
        assert!(matches!(like, Err(SocialError::NotFound("post"))));
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let store = Store::memory();
        let ids = users(&store, &["ana", "bob"]).await;
        let engine = ToggleEngine::new(store.clone());
        let memory = store.as_memory().unwrap();
        memory.fail_next(FailPoint::InsertFollow, FailKind::Conflict);

        let out = engine.toggle_follow(ids[0], ids[1]).await.unwrap();
        assert!(out.following);
        assert_eq!(out.followers_count, 1);
        assert_eq!(memory.count_follows().await, 1);
    }

    #[tokio::test]
    async fn repeated_conflict_surfaces_and_rolls_back() {
        let store = Store::memory();
        let ids = users(&store, &["x", "author"]).await;
        let post = post_by(&store, ids[1]).await;
        let engine = ToggleEngine::new(store.clone());
        let memory = store.as_memory().unwrap();
        memory.fail_next(FailPoint::InsertLike, FailKind::Conflict);
        memory.fail_next(FailPoint::InsertLike, FailKind::Conflict);

        let err = engine.toggle_like(ids[0], post).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(memory.count_likes().await, 0);
        let viewed = store.post(None, post).await.unwrap().unwrap();
        assert_eq!(viewed.likes_count, 0);
    }

    #[tokio::test]
    async fn store_failure_is_not_retried() {
        let store = Store::memory();
        let ids = users(&store, &["ana", "bob"]).await;
        let engine = ToggleEngine::new(store.clone());
        let memory = store.as_memory().unwrap();
        memory.fail_next(FailPoint::InsertFollow, FailKind::Unavailable);

        let err = engine.toggle_follow(ids[0], ids[1]).await.unwrap_err();
        assert!(matches!(err, SocialError::Store(_)));
        assert_eq!(profile_counts(&store, "bob").await, (0, 0));
    }

    #[tokio::test]
    async fn concurrent_toggles_keep_counters_consistent() {
        let store = Store::memory();
        let ids = users(&store, &["ana", "bob"]).await;
        let engine = ToggleEngine::new(store.clone());

        let handles: Vec<_> = (0..9)
            .map(|_| {
                let engine = engine.clone();
                let (a, b) = (ids[0], ids[1]);
                tokio::spawn(async move { engine.toggle_follow(a, b).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_follows().await, 1);
        assert_eq!(profile_counts(&store, "bob").await, (1, 0));
        assert_eq!(profile_counts(&store, "ana").await, (0, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_likes_on_one_pair_stay_consistent() {
        let store = Store::memory();
        let ids = users(&store, &["fan", "author"]).await;
        let post = post_by(&store, ids[1]).await;
        let engine = ToggleEngine::new(store.clone());

        let handles: Vec<_> = (0..7)
            .map(|_| {
                let engine = engine.clone();
                let fan = ids[0];
                tokio::spawn(async move { engine.toggle_like(fan, post).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let viewed = store.post(Some(ids[0]), post).await.unwrap().unwrap();
        assert!(viewed.liked);
        assert_eq!(viewed.likes_count, 1);
        let report = CounterAudit::new(store.clone()).run(false).await.unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cross_follows_stay_consistent() {
        let store = Store::memory();
        let ids = users(&store, &["ana", "bob"]).await;
        let engine = ToggleEngine::new(store.clone());

        // Six ana->bob toggles cancel out; five bob->ana toggles leave one.
        let handles: Vec<_> = (0..11)
            .map(|n| {
                let engine = engine.clone();
                let (actor, target) = if n % 2 == 0 {
                    (ids[0], ids[1])
                } else {
                    (ids[1], ids[0])
                };
                tokio::spawn(async move { engine.toggle_follow(actor, target).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_follows().await, 1);
        assert_eq!(profile_counts(&store, "ana").await, (1, 0));
        assert_eq!(profile_counts(&store, "bob").await, (0, 1));
        let report = CounterAudit::new(store.clone()).run(false).await.unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Follow(usize, usize),
        Like(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4_usize, 0..4_usize).prop_map(|(a, b)| Op::Follow(a, b)),
            (0..4_usize, 0..2_usize).prop_map(|(a, p)| Op::Like(a, p)),
        ]
    }

    proptest! {
        /// After any sequence of toggles every stored counter equals the
        /// number of relationship rows it summarizes.
        #[test]
        fn counters_match_relationships(ops in prop::collection::vec(op(), 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = Store::memory();
                let ids = users(&store, &["u0", "u1", "u2", "u3"]).await;
                let posts = [post_by(&store, ids[0]).await, post_by(&store, ids[1]).await];
                let engine = ToggleEngine::new(store.clone());

                for op in ops {
                    match op {
                        Op::Follow(a, b) if a == b => {
                            assert!(engine.toggle_follow(ids[a], ids[b]).await.is_err());
                        }
                        Op::Follow(a, b) => {
                            engine.toggle_follow(ids[a], ids[b]).await.unwrap();
                        }
                        Op::Like(a, p) => {
                            engine.toggle_like(ids[a], posts[p]).await.unwrap();
                        }
                    }
                }

                assert!(store.user_counter_drift().await.unwrap().is_empty());
                assert!(store.post_counter_drift().await.unwrap().is_empty());
            });
        }
    }
}
