//! Post fan-out: copy a committed post into every follower's timeline.
//!
//! ```text
//! create_post --commit--> FanoutHandle::submit (try_send, never blocks)
//!                               |
//!                         bounded mpsc queue
//!                               |
//!               +---------------+---------------+
//!            worker 0        worker 1   ...  worker N-1
//!               |  load author profile (best effort)
//!               |  INSERT ... SELECT follower ... RETURNING
//!               v
//!        broadcast<FanoutEvent>  +  FanoutStats
//! ```
//!
//! Fan-out never affects the outcome of post creation. Every failure
//! (queue full, pool closed, store error, timeout, cancellation) is logged,
//! counted and published as [`FanoutEvent::Failed`]; nothing is retried.
//!
//! The pool owns its [`CancellationToken`]. [`FanoutPool::shutdown`]
//! closes the queue and lets workers drain it; [`FanoutPool::abort`]
//! cancels in-flight tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use murmur_db::{DbError, Store};
use murmur_types::{Post, PostId, TimelineItem};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FanoutConfig;

/// Capacity of the event channel.
///
/// A subscriber that falls behind by more than this many events receives
/// [`broadcast::error::RecvError::Lagged`] and skips ahead.
const EVENT_CAPACITY: usize = 256;

/// Why a fan-out did not deliver.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// The queue was full at submission.
    #[error("fan-out queue is full")]
    QueueFull,

    /// The pool has shut down.
    #[error("fan-out pool is closed")]
    Closed,

    /// Writing timeline entries failed.
    #[error("fan-out store error: {0}")]
    Store(#[from] DbError),

    /// The task ran longer than the configured timeout.
    #[error("fan-out timed out after {0:?}")]
    Timeout(Duration),

    /// The pool was aborted while the task ran.
    #[error("fan-out cancelled")]
    Cancelled,
}

/// Outcome of one fan-out, published to subscribers.
#[derive(Debug, Clone)]
pub enum FanoutEvent {
    /// Timeline entries were written for every follower.
    Delivered {
        /// The fanned-out post.
        post_id: PostId,
        /// One item per follower, each carrying the post.
        items: Vec<TimelineItem>,
    },
    /// The fan-out did not happen.
    Failed {
        /// The post that was not fanned out.
        post_id: PostId,
        /// Rendered [`FanoutError`].
        error: String,
    },
}

/// Lifetime counters of a pool.
#[derive(Debug, Default)]
pub struct FanoutStats {
    submitted: AtomicU64,
    delivered: AtomicU64,
    items: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`FanoutStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStatsSnapshot {
    /// Tasks accepted into the queue.
    pub submitted: u64,
    /// Tasks that completed.
    pub delivered: u64,
    /// Timeline entries written by completed tasks.
    pub items: u64,
    /// Tasks rejected at submission or failed while running.
    pub failed: u64,
}

impl FanoutStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> FanoutStatsSnapshot {
        FanoutStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the pool, its handles and its workers.
#[derive(Debug, Clone)]
struct Shared {
    stats: Arc<FanoutStats>,
    events: broadcast::Sender<FanoutEvent>,
}

impl Shared {
    fn fail(&self, post_id: PostId, error: &FanoutError) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        match error {
            FanoutError::Store(_) => {
                tracing::error!(post_id = %post_id, error = %error, "fan-out failed");
            }
            _ => tracing::warn!(post_id = %post_id, error = %error, "fan-out failed"),
        }
        // No subscribers is fine.
        let _ = self.events.send(FanoutEvent::Failed {
            post_id,
            error: error.to_string(),
        });
    }

    fn delivered(&self, post_id: PostId, items: Vec<TimelineItem>) {
        let count = u64::try_from(items.len()).unwrap_or(u64::MAX);
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        self.stats.items.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(post_id = %post_id, items = count, "fan-out delivered");
        let _ = self.events.send(FanoutEvent::Delivered { post_id, items });
    }
}

/// Cloneable submission side of a [`FanoutPool`].
///
/// Holds only a weak reference to the queue, so outstanding handles do not
/// keep the pool alive after [`FanoutPool::shutdown`].
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    sender: mpsc::WeakSender<Post>,
    shared: Shared,
}

impl FanoutHandle {
    /// Queue `post` for fan-out without waiting.
    ///
    /// The post must already be committed. A rejection is logged, counted
    /// and published before it is returned.
    ///
    /// # Errors
    ///
    /// - [`FanoutError::QueueFull`] if the queue is at capacity.
    /// - [`FanoutError::Closed`] if the pool has shut down.
    pub fn submit(&self, post: Post) -> Result<(), FanoutError> {
        let post_id = post.id;
        let result = match self.sender.upgrade() {
            None => Err(FanoutError::Closed),
            Some(sender) => match sender.try_send(post) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(FanoutError::QueueFull),
                Err(TrySendError::Closed(_)) => Err(FanoutError::Closed),
            },
        };
        match result {
            Ok(()) => {
                self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.shared.fail(post_id, &err);
                Err(err)
            }
        }
    }

    /// Receive every subsequent [`FanoutEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.shared.events.subscribe()
    }

    /// Current counters.
    pub fn stats(&self) -> FanoutStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Worker pool draining the fan-out queue.
#[derive(Debug)]
pub struct FanoutPool {
    sender: mpsc::Sender<Post>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shared: Shared,
}

impl FanoutPool {
    /// Spawn `config.workers` workers on the current runtime.
    pub fn start(store: &Store, config: &FanoutConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Shared {
            stats: Arc::new(FanoutStats::default()),
            events,
        };
        let cancel = CancellationToken::new();
        let worker_count = config.workers.max(1);

        let workers = (0..worker_count)
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    store: store.clone(),
                    receiver: Arc::clone(&receiver),
                    cancel: cancel.clone(),
                    timeout: config.task_timeout(),
                    shared: shared.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            "fan-out pool started"
        );
        Self {
            sender,
            workers,
            cancel,
            shared,
        }
    }

    /// A submission handle.
    pub fn handle(&self) -> FanoutHandle {
        FanoutHandle {
            sender: self.sender.downgrade(),
            shared: self.shared.clone(),
        }
    }

    /// Receive every subsequent [`FanoutEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.shared.events.subscribe()
    }

    /// Current counters.
    pub fn stats(&self) -> FanoutStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop accepting work, let workers finish everything queued, then
    /// wait for them.
    pub async fn shutdown(self) {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        join_workers(workers).await;
        tracing::info!("fan-out pool drained");
    }

    /// Cancel queued and in-flight tasks and wait for the workers.
    ///
    /// Cancelled in-flight tasks are reported as [`FanoutError::Cancelled`].
    pub async fn abort(self) {
        self.cancel.cancel();
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        join_workers(workers).await;
        tracing::info!("fan-out pool aborted");
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(workers).await {
        if let Err(err) = result {
            tracing::error!(error = %err, "fan-out worker panicked");
        }
    }
}

struct Worker {
    id: usize,
    store: Store,
    receiver: Arc<Mutex<mpsc::Receiver<Post>>>,
    cancel: CancellationToken,
    timeout: Duration,
    shared: Shared,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "fan-out worker started");
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = async { self.receiver.lock().await.recv().await } => next,
            };
            // `None` once the queue is closed and empty.
            let Some(post) = next else { break };
            self.process(post).await;
        }
        tracing::debug!(worker = self.id, "fan-out worker stopped");
    }

    async fn process(&self, post: Post) {
        let post_id = post.id;
        let outcome = tokio::select! {
            () = self.cancel.cancelled() => Err(FanoutError::Cancelled),
            result = tokio::time::timeout(self.timeout, deliver(&self.store, post)) => {
                result.unwrap_or(Err(FanoutError::Timeout(self.timeout)))
            }
        };
        match outcome {
            Ok(items) => self.shared.delivered(post_id, items),
            Err(err) => self.shared.fail(post_id, &err),
        }
    }
}

/// Attach the author profile and write one timeline entry per follower.
async fn deliver(store: &Store, mut post: Post) -> Result<Vec<TimelineItem>, FanoutError> {
    match store.user_by_id(post.user_id).await {
        Ok(user) => post.user = user,
        Err(err) => tracing::warn!(
            post_id = %post.id,
            error = %err,
            "author profile unavailable, fanning out without it"
        ),
    }
    post.mine = false;
    post.liked = false;

    let entries = store.fan_out_post(post.id, post.user_id).await?;
    Ok(entries
        .into_iter()
        .map(|entry| TimelineItem {
            id: entry.id,
            user_id: entry.user_id,
            post_id: post.id,
            post: post.clone(),
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use murmur_db::{FailKind, FailPoint, PostInsert};

    use super::*;

    fn config(workers: usize, queue_capacity: usize, task_timeout_ms: u64) -> FanoutConfig {
        FanoutConfig {
            workers,
            queue_capacity,
            task_timeout_ms,
        }
    }

    /// An author with `followers` followers and one committed post.
    async fn seeded(followers: usize) -> (Store, Post) {
        let store = Store::memory();
        let author = store
            .create_user("author@example.com", "author")
            .await
            .unwrap();
        let mut follower_ids = Vec::with_capacity(followers);
        for n in 0..followers {
            let name = format!("f{n}");
            let follower = store
                .create_user(&format!("{name}@example.com"), &name)
                .await
                .unwrap();
            follower_ids.push(follower.id);
        }

        let mut tx = store.begin().await.unwrap();
        for follower in follower_ids {
            tx.insert_follow(follower, author.id).await.unwrap();
        }
        let inserted = tx
            .insert_post(PostInsert {
                user_id: author.id,
                content: "hello",
                spoiler_of: None,
                nsfw: false,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let post = store.post(Some(author.id), inserted.id).await.unwrap().unwrap();
        (store, post)
    }

    async fn next_event(rx: &mut broadcast::Receiver<FanoutEvent>) -> FanoutEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_one_item_per_follower() {
        let (store, post) = seeded(3).await;
        let pool = FanoutPool::start(&store, &config(2, 8, 5_000));
        let mut events = pool.subscribe();
        let mut post = post;
        post.user = None;

        pool.handle().submit(post.clone()).unwrap();
        let FanoutEvent::Delivered { post_id, items } = next_event(&mut events).await else {
            panic!("expected delivery");
        };
        assert_eq!(post_id, post.id);
        assert_eq!(items.len(), 3);
        for item in &items {
            assert_eq!(item.post_id, post.id);
            assert!(!item.post.mine);
            assert_eq!(
                item.post.user.as_ref().map(|u| u.username.as_str()),
                Some("author")
            );
        }

        pool.shutdown().await;
        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_timeline_items(post.id).await, 3);
    }

    #[tokio::test]
    async fn store_failure_is_published_and_counted() {
        let (store, post) = seeded(2).await;
        store
            .as_memory()
            .unwrap()
            .fail_next(FailPoint::FanOut, FailKind::Unavailable);
        let pool = FanoutPool::start(&store, &config(1, 8, 5_000));
        let mut events = pool.subscribe();

        pool.handle().submit(post.clone()).unwrap();
        let event = next_event(&mut events).await;
        assert!(matches!(event, FanoutEvent::Failed { post_id, .. } if post_id == post.id));

        pool.shutdown().await;
        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_timeline_items(post.id).await, 0);
    }

    #[tokio::test]
    async fn profile_failure_still_delivers() {
        let (store, post) = seeded(1).await;
        store
            .as_memory()
            .unwrap()
            .fail_next(FailPoint::UserById, FailKind::Unavailable);
        let pool = FanoutPool::start(&store, &config(1, 8, 5_000));
        let mut events = pool.subscribe();
        let mut post = post;
        post.user = None;

        pool.handle().submit(post).unwrap();
        let FanoutEvent::Delivered { items, .. } = next_event(&mut events).await else {
            panic!("expected delivery");
        };
        assert_eq!(items.len(), 1);
        assert!(items.iter().all(|item| item.post.user.is_none()));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let (store, post) = seeded(1).await;
        // An open transaction holds the in-memory tables.
        let blocker = store.begin().await.unwrap();
        let pool = FanoutPool::start(&store, &config(1, 8, 50));
        let mut events = pool.subscribe();

        pool.handle().submit(post).unwrap();
        let event = next_event(&mut events).await;
        let FanoutEvent::Failed { error, .. } = event else {
            panic!("expected failure");
        };
        assert!(error.contains("timed out"));
        drop(blocker);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (store, post) = seeded(1).await;
        let blocker = store.begin().await.unwrap();
        let pool = FanoutPool::start(&store, &config(1, 1, 10_000));
        let handle = pool.handle();

        // One task can be in flight and one queued; the rest must bounce.
        let results: Vec<_> = (0..4).map(|_| handle.submit(post.clone())).collect();
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(FanoutError::QueueFull)))
        );
        assert!(handle.stats().failed >= 1);

        drop(blocker);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_closes_handles() {
        let (store, post) = seeded(2).await;
        let pool = FanoutPool::start(&store, &config(2, 16, 5_000));
        let handle = pool.handle();
        for _ in 0..5 {
            handle.submit(post.clone()).unwrap();
        }
        pool.shutdown().await;

        let stats = handle.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.items, 10);
        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_timeline_items(post.id).await, 10);

        assert!(matches!(handle.submit(post), Err(FanoutError::Closed)));
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_work() {
        let (store, post) = seeded(1).await;
        let blocker = store.begin().await.unwrap();
        let pool = FanoutPool::start(&store, &config(1, 8, 60_000));
        let handle = pool.handle();
        handle.submit(post.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), pool.abort())
            .await
            .unwrap();
        drop(blocker);
        let memory = store.as_memory().unwrap();
        assert_eq!(memory.count_timeline_items(post.id).await, 0);
        assert_eq!(handle.stats().delivered, 0);
    }

    #[tokio::test]
    async fn author_without_followers_delivers_nothing() {
        let (store, post) = seeded(0).await;
        let pool = FanoutPool::start(&store, &config(1, 8, 5_000));
        let mut events = pool.subscribe();
        pool.handle().submit(post).unwrap();
        let FanoutEvent::Delivered { items, .. } = next_event(&mut events).await else {
            panic!("expected delivery");
        };
        assert!(items.is_empty());
        pool.shutdown().await;
    }
}
