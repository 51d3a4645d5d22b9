use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ledgerdesk_types::events::{Change, Topic};

const FEED_CAPACITY: usize = 1024;

/// Fan-out of committed changes to registered observers.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    /// Every observer holds its own receiver on this channel.
    broadcast_tx: broadcast::Sender<Change>,

    next_id: AtomicU64,

    /// Live registrations: subscription id -> topic
    registrations: Mutex<HashMap<u64, Topic>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(FeedInner {
                broadcast_tx,
                next_id: AtomicU64::new(1),
                registrations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publish a change to every observer. Returns the number of live receivers.
    pub fn publish(&self, change: Change) -> usize {
        debug!("Publishing {:?}", change);
        self.inner.broadcast_tx.send(change).unwrap_or(0)
    }

    /// Register an observer for `topic`.
    ///
    /// `handler` runs for each change on `topic` accepted by `predicate`, at
    /// most once per change, in publication order for this subscription. No
    /// ordering is guaranteed across subscriptions. Must be called from within
    /// a Tokio runtime.
    pub fn register<P, H, Fut>(&self, topic: Topic, predicate: P, handler: H) -> Subscription
    where
        P: Fn(&Change) -> bool + Send + Sync + 'static,
        H: Fn(Change) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Subscribe before spawning so nothing published after this call is missed.
        let mut rx = self.inner.broadcast_tx.subscribe();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations().insert(id, topic);

        let task = tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscription {} on {:?} lagged by {} changes", id, topic, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if change.topic() != topic || !predicate(&change) {
                    continue;
                }

                handler(change).await;
            }
        });

        debug!("Registered subscription {} on {:?}", id, topic);
        Subscription {
            id,
            topic,
            task: Some(task),
            feed: self.clone(),
        }
    }

    /// Number of live registrations, optionally restricted to one topic.
    pub fn active_subscriptions(&self, topic: Option<Topic>) -> usize {
        let registrations = self.registrations();
        match topic {
            Some(topic) => registrations.values().filter(|t| **t == topic).count(),
            None => registrations.len(),
        }
    }

    fn unregister(&self, id: u64) {
        self.registrations().remove(&id);
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Topic>> {
        // The map holds plain data; a poisoned guard is still consistent.
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle returned by [`ChangeFeed::register`].
///
/// Dropping the handle cancels the registration.
pub struct Subscription {
    id: u64,
    topic: Topic,
    task: Option<JoinHandle<()>>,
    feed: ChangeFeed,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery. A handler already running is aborted at its next await.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.feed.unregister(self.id);
            debug!("Cancelled subscription {} on {:?}", self.id, self.topic);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}
