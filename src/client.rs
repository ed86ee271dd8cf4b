//! Thin typed façade over the pool scripts.
//!
//! `PoolClient` owns the command connection and the prepared scripts for
//! one pool. It is stateless apart from connections: all pool state lives
//! in the store and is only touched through the atomic scripts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keys;
use crate::scripts::PoolScripts;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("object name must be a non-empty string")]
    EmptyObject,
}

/// Result of a claim script invocation: the session the caller generated
/// and the objects now leased under it.
#[derive(Debug, Clone)]
pub struct ClaimedObjects {
    pub session: String,
    pub objects: Vec<String>,
}

/// Advisory size snapshot of one pool. Read with plain commands rather
/// than a script, so the numbers may be mutually inconsistent under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: u64,
    pub queued: u64,
    pub claimed: u64,
    pub delayed: u64,
}

/// Client for one pool's keyspace.
pub struct PoolClient {
    name: String,
    redis: ConnectionManager,
    client: redis::Client,
    scripts: PoolScripts,
    backoff: Duration,
    subscription: Mutex<Weak<Subscription>>,
}

impl PoolClient {
    /// Connect to the store and prepare the pool scripts.
    pub async fn connect(name: &str, url: &str, backoff: Duration) -> Result<Arc<Self>, PoolError> {
        let client = redis::Client::open(url)?;
        let redis = client.get_connection_manager().await?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            redis,
            client,
            scripts: PoolScripts::new(),
            backoff,
            subscription: Mutex::new(Weak::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue objects with optional tags and an optional delay. Returns the
    /// objects that were not already tracked by the pool, in input order.
    pub async fn queue_tagged(
        &self,
        tags: &HashMap<String, String>,
        objects: &[String],
        delay: Duration,
    ) -> Result<Vec<String>, PoolError> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        if objects.iter().any(|o| o.is_empty()) {
            return Err(PoolError::EmptyObject);
        }

        let mut inv = self.scripts.queue_tagged.prepare_invoke();
        inv.key(keys::all_key(&self.name))
            .key(keys::queued_key(&self.name))
            .key(keys::queue_key(&self.name))
            .key(keys::delayed_key(&self.name))
            .arg(&self.name)
            .arg(delay.as_secs())
            .arg(tags.len());
        for (tag, value) in tags {
            inv.arg(tag).arg(value);
        }
        for object in objects {
            inv.arg(object);
        }

        let added: Vec<String> = inv.invoke_async(&mut self.redis.clone()).await?;
        debug!(pool = %self.name, added = added.len(), delay_secs = delay.as_secs(), "queued objects");
        Ok(added)
    }

    /// Claim up to `max_count` objects under a freshly generated session.
    /// With a tag and `max_count >= 2`, the batch is filled with objects
    /// sharing the head object's value for that tag.
    pub async fn claim(
        &self,
        max_count: usize,
        expiration: Duration,
        tag: Option<&str>,
    ) -> Result<ClaimedObjects, PoolError> {
        let session = Uuid::new_v4().to_string();
        if max_count == 0 {
            return Ok(ClaimedObjects {
                session,
                objects: Vec::new(),
            });
        }

        let mut inv = self.scripts.claim.prepare_invoke();
        inv.key(keys::queued_key(&self.name))
            .key(keys::queue_key(&self.name))
            .key(keys::claimed_key(&self.name))
            .arg(&self.name)
            .arg(&session)
            .arg(expiration.as_secs())
            .arg(max_count)
            .arg(tag.unwrap_or(""));

        let objects: Vec<String> = inv.invoke_async(&mut self.redis.clone()).await?;
        if !objects.is_empty() {
            debug!(pool = %self.name, session = %session, count = objects.len(), "claimed objects");
        }
        Ok(ClaimedObjects { session, objects })
    }

    /// Reset the lease TTL on every object, failing if any lease is not
    /// held by `session`.
    pub async fn extend(
        &self,
        objects: &[String],
        session: &str,
        expiration: Duration,
    ) -> Result<bool, PoolError> {
        if objects.is_empty() {
            return Ok(true);
        }
        let mut inv = self.scripts.extend.prepare_invoke();
        inv.key(keys::claimed_key(&self.name))
            .arg(&self.name)
            .arg(session)
            .arg(expiration.as_secs());
        for object in objects {
            inv.arg(object);
        }
        let ok: bool = inv.invoke_async(&mut self.redis.clone()).await?;
        Ok(ok)
    }

    /// Permanently remove objects from the pool, failing if any lease is
    /// not held by `session`.
    pub async fn release(&self, objects: &[String], session: &str) -> Result<bool, PoolError> {
        if objects.is_empty() {
            return Ok(true);
        }
        let mut inv = self.scripts.release.prepare_invoke();
        inv.key(keys::all_key(&self.name))
            .key(keys::claimed_key(&self.name))
            .arg(&self.name)
            .arg(session);
        for object in objects {
            inv.arg(object);
        }
        let ok: bool = inv.invoke_async(&mut self.redis.clone()).await?;
        Ok(ok)
    }

    /// Return objects to the queue (optionally delayed), failing if any
    /// lease is not held by `session`.
    pub async fn requeue(
        &self,
        objects: &[String],
        session: &str,
        delay: Duration,
    ) -> Result<bool, PoolError> {
        if objects.is_empty() {
            return Ok(true);
        }
        let mut inv = self.scripts.requeue.prepare_invoke();
        inv.key(keys::queued_key(&self.name))
            .key(keys::queue_key(&self.name))
            .key(keys::claimed_key(&self.name))
            .key(keys::delayed_key(&self.name))
            .arg(&self.name)
            .arg(session)
            .arg(delay.as_secs());
        for object in objects {
            inv.arg(object);
        }
        let ok: bool = inv.invoke_async(&mut self.redis.clone()).await?;
        Ok(ok)
    }

    /// Requeue objects whose lease has expired.
    pub async fn clean_expired(&self) -> Result<Vec<String>, PoolError> {
        let mut inv = self.scripts.clean_expired.prepare_invoke();
        inv.key(keys::queued_key(&self.name))
            .key(keys::queue_key(&self.name))
            .key(keys::claimed_key(&self.name))
            .arg(&self.name);
        let moved: Vec<String> = inv.invoke_async(&mut self.redis.clone()).await?;
        Ok(moved)
    }

    /// Promote objects whose delay has elapsed.
    pub async fn clean_delayed(&self) -> Result<Vec<String>, PoolError> {
        let mut inv = self.scripts.clean_delayed.prepare_invoke();
        inv.key(keys::queued_key(&self.name))
            .key(keys::queue_key(&self.name))
            .key(keys::delayed_key(&self.name))
            .arg(&self.name);
        let moved: Vec<String> = inv.invoke_async(&mut self.redis.clone()).await?;
        Ok(moved)
    }

    /// Run both cleanups; the result is the union of requeued and
    /// promoted objects.
    pub async fn clean(&self) -> Result<Vec<String>, PoolError> {
        let mut moved = self.clean_expired().await?;
        moved.extend(self.clean_delayed().await?);
        Ok(moved)
    }

    /// Advisory size snapshot of the pool.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let mut conn = self.redis.clone();
        let total: u64 = conn.scard(keys::all_key(&self.name)).await?;
        let queued: u64 = conn.llen(keys::queue_key(&self.name)).await?;
        let claimed: u64 = conn.llen(keys::claimed_key(&self.name)).await?;
        let delayed: u64 = conn.llen(keys::delayed_key(&self.name)).await?;
        Ok(PoolStatus {
            total,
            queued,
            claimed,
            delayed,
        })
    }

    /// Subscribe to the pool's queued-notification channel.
    ///
    /// The underlying pub/sub connection is shared: the first subscriber
    /// spawns it lazily, later subscribers fan out from the same
    /// broadcast, and dropping the last handle releases the connection.
    /// Pub/sub mode precludes commands, so the subscriber duplicates the
    /// connection rather than reusing the command one.
    pub fn has_queued(&self) -> HasQueued {
        let mut slot = self.subscription.lock().unwrap();
        if let Some(shared) = slot.upgrade() {
            return HasQueued {
                rx: shared.tx.subscribe(),
                _shared: shared,
            };
        }

        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(subscriber_loop(
            self.client.clone(),
            keys::queued_channel(&self.name),
            tx.clone(),
            self.backoff,
        ));
        let shared = Arc::new(Subscription { tx, task });
        *slot = Arc::downgrade(&shared);
        HasQueued {
            rx,
            _shared: shared,
        }
    }
}

struct Subscription {
    tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A handle on the shared queued-notification stream. Any received unit
/// means "work may be available"; coalescing drops no information.
pub struct HasQueued {
    rx: broadcast::Receiver<()>,
    _shared: Arc<Subscription>,
}

impl HasQueued {
    /// Wait for the next notification. Missed messages while lagging
    /// collapse into a single signal.
    pub async fn recv(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return,
                // Unreachable while _shared holds the sender; a closed
                // stream yields no further signals.
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

async fn subscriber_loop(
    client: redis::Client,
    channel: String,
    tx: broadcast::Sender<()>,
    backoff: Duration,
) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(err) => {
                warn!(channel = %channel, error = %err, "pub/sub connect failed, backing off");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        if let Err(err) = pubsub.subscribe(&channel).await {
            warn!(channel = %channel, error = %err, "subscribe failed, backing off");
            tokio::time::sleep(backoff).await;
            continue;
        }
        debug!(channel = %channel, "queued-notification subscriber connected");

        let mut messages = pubsub.into_on_message();
        while messages.next().await.is_some() {
            // Receivers may briefly be zero between subscribers; that is
            // not an error, the broadcast just drops the message.
            let _ = tx.send(());
        }

        warn!(channel = %channel, "queued-notification stream ended, resubscribing");
        tokio::time::sleep(backoff).await;
    }
}
