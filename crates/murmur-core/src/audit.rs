//! Denormalized counter reconciliation.
//!
//! Counters are maintained inside the toggle transactions, so drift should
//! never appear. The audit recomputes every counter from the relationship
//! rows, reports the rows that disagree and, in repair mode, rewrites them
//! from the relationship rows in one transaction.
//!
//! [`CounterAudit`] needs only a [`Store`], so operator tooling can run it
//! without a fan-out pool.

use murmur_db::{PostCounterDrift, Store, StoreTx, UserCounterDrift};

use crate::error::SocialError;
use crate::service::SocialService;
use crate::transaction::settle;

/// Outcome of a counter audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Users whose follow counters disagreed with `follows`.
    pub user_drift: Vec<UserCounterDrift>,
    /// Posts whose like counter disagreed with `post_likes`.
    pub post_drift: Vec<PostCounterDrift>,
    /// Whether the drifting counters were rewritten.
    pub repaired: bool,
}

impl AuditReport {
    /// Whether every counter matched its relationship rows.
    pub const fn is_clean(&self) -> bool {
        self.user_drift.is_empty() && self.post_drift.is_empty()
    }
}

impl SocialService {
    /// Compare every denormalized counter with its relationship rows.
    ///
    /// See [`CounterAudit::run`].
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure.
    pub async fn audit_counters(&self, repair: bool) -> Result<AuditReport, SocialError> {
        CounterAudit::new(self.store.clone()).run(repair).await
    }
}

/// Counter audit over a store.
#[derive(Debug, Clone)]
pub struct CounterAudit {
    store: Store,
}

impl CounterAudit {
    /// Audit the counters held in `store`.
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compare every denormalized counter with its relationship rows.
    ///
    /// With `repair`, drifting counters are recomputed in a single
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`SocialError::Store`] on storage failure; a failed repair is rolled
    /// back as a whole.
    pub async fn run(&self, repair: bool) -> Result<AuditReport, SocialError> {
        let user_drift = self.store.user_counter_drift().await?;
        let post_drift = self.store.post_counter_drift().await?;
        let mut report = AuditReport {
            user_drift,
            post_drift,
            repaired: false,
        };

        for drift in &report.user_drift {
            tracing::warn!(
                user_id = %drift.user_id,
                followers_count = drift.followers_count,
                actual_followers = drift.actual_followers,
                followees_count = drift.followees_count,
                actual_followees = drift.actual_followees,
                "follow counters drifted"
            );
        }
        for drift in &report.post_drift {
            tracing::warn!(
                post_id = %drift.post_id,
                likes_count = drift.likes_count,
                actual_likes = drift.actual_likes,
                "like counter drifted"
            );
        }

        if repair && !report.is_clean() {
            let mut tx = self.store.begin().await?;
            let result = recount(&mut tx, &report).await;
            settle(tx, result).await?;
            report.repaired = true;
            tracing::info!(
                users = report.user_drift.len(),
                posts = report.post_drift.len(),
                "counters repaired"
            );
        }
        Ok(report)
    }
}

async fn recount(tx: &mut StoreTx, report: &AuditReport) -> Result<(), SocialError> {
    for drift in &report.user_drift {
        tx.recount_user_counters(drift.user_id).await?;
    }
    for drift in &report.post_drift {
        tx.recount_likes(drift.post_id).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use murmur_db::{PostInsert, Store};
    use murmur_types::NewPost;

    use super::CounterAudit;
    use crate::service::tests::{register, service};

    #[tokio::test]
    async fn audit_runs_on_a_bare_store() {
        let store = Store::memory();
        let ana = store.create_user("ana@example.com", "ana").await.unwrap().id;
        let mut tx = store.begin().await.unwrap();
        let post = tx
            .insert_post(PostInsert {
                user_id: ana,
                content: "hi",
                spoiler_of: None,
                nsfw: false,
            })
            .await
            .unwrap()
            .id;
        tx.commit().await.unwrap();
        let memory = store.as_memory().unwrap();
        assert!(memory.overwrite_likes_count(post, 2).await);

        let audit = CounterAudit::new(store.clone());
        let report = audit.run(true).await.unwrap();
        assert!(report.repaired);
        assert_eq!(report.post_drift.len(), 1);
        assert_eq!(report.post_drift[0].actual_likes, 0);
        assert!(audit.run(false).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn consistent_store_is_clean() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        register(&service, "bob").await;
        service.toggle_follow(ana, "bob").await.unwrap();

        let report = service.audit_counters(true).await.unwrap();
        assert!(report.is_clean());
        assert!(!report.repaired);
    }

    #[tokio::test]
    async fn drift_is_reported_and_repaired() {
        let (service, _pool) = service();
        let ana = register(&service, "ana").await;
        let bob = register(&service, "bob").await;
        service.toggle_follow(ana, "bob").await.unwrap();
        let post = service
            .create_post(
                bob,
                &NewPost {
                    content: String::from("hi"),
                    ..NewPost::default()
                },
            )
            .await
            .unwrap()
            .post_id;
        service.toggle_like(ana, post).await.unwrap();

        let memory = service.store().as_memory().unwrap();
        assert!(memory.overwrite_user_counters(bob, 7, 0).await);
        assert!(memory.overwrite_likes_count(post, 3).await);

        let dry = service.audit_counters(false).await.unwrap();
        assert_eq!(dry.user_drift.len(), 1);
        assert_eq!(dry.user_drift[0].user_id, bob);
        assert_eq!(dry.user_drift[0].actual_followers, 1);
        assert_eq!(dry.post_drift.len(), 1);
        assert_eq!(dry.post_drift[0].actual_likes, 1);
        assert!(!dry.repaired);
        assert!(!service.audit_counters(false).await.unwrap().is_clean());

        let fixed = service.audit_counters(true).await.unwrap();
        assert!(fixed.repaired);
        assert!(service.audit_counters(false).await.unwrap().is_clean());
        assert_eq!(service.post(None, post).await.unwrap().likes_count, 1);
        let profile = service.user_profile(None, "bob").await.unwrap();
        assert_eq!(profile.followers_count, 1);
        assert_eq!(profile.followees_count, 0);
    }
}
