//! Dispatch engine: turns queued-notifications and timers into a bounded
//! stream of claims.
//!
//! One engine task per dispatcher turns a bootstrap tick, the pool's
//! queued-notification channel (with a periodic resignal after each
//! message) and the "last claim done" edge into claim attempts. The
//! `Notify` permit is a capacity-1 gate: triggers that arrive while an
//! attempt is in flight coalesce into at most one follow-up attempt, so
//! a burst of store notifications cannot produce a thundering herd of
//! claim calls.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::debug;

use crate::claim::Claim;
use crate::client::HasQueued;
use crate::pool::ObjectPool;
use crate::retry::retry_forever;

/// Objects re-queued before every claim attempt; the self-priming
/// processor idiom. Queueing is a no-op for objects the pool already
/// tracks, so the seed only replaces released work.
#[derive(Debug, Clone, Default)]
pub struct SeedQueue {
    pub objects: Vec<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum number of concurrently outstanding claims.
    pub max_claimed_count: usize,
    /// When set, claims are tagged batches co-locating related objects.
    pub tag: Option<String>,
    /// Batch size limit for tagged claims.
    pub max_objects_per_claim: usize,
    pub seed: Option<SeedQueue>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_claimed_count: 1,
            tag: None,
            max_objects_per_claim: 1,
            seed: None,
        }
    }
}

/// A running dispatcher. Dropping it stops the engine and the signal
/// forwarding; claims already emitted keep their own lifecycles.
pub struct Dispatcher {
    claims: mpsc::Receiver<Arc<Claim>>,
    engine: JoinHandle<()>,
    signals: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(pool: Arc<ObjectPool>, options: DispatchOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.max_claimed_count.max(1));
        let tick = Arc::new(Notify::new());
        let signals = tokio::spawn(signal_loop(
            pool.client().has_queued(),
            Arc::clone(&tick),
            pool.settings().resignal_interval(),
        ));
        let engine = tokio::spawn(engine_loop(pool, options, tx, Arc::clone(&tick)));
        Self {
            claims: rx,
            engine,
            signals,
        }
    }

    /// Receive the next claim. Returns `None` only after the dispatcher
    /// has been stopped.
    pub async fn next_claim(&mut self) -> Option<Arc<Claim>> {
        self.claims.recv().await
    }
}

impl Stream for Dispatcher {
    type Item = Arc<Claim>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.claims.poll_recv(cx)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.engine.abort();
        self.signals.abort();
    }
}

/// Forward queued-notifications as ticks, with a periodic resignal that
/// restarts on every real message. Until the first message arrives there
/// is nothing to resignal; the engine's bootstrap attempt covers backlog
/// present at subscription time.
async fn signal_loop(mut has_queued: HasQueued, tick: Arc<Notify>, every: Duration) {
    has_queued.recv().await;
    tick.notify_one();
    let mut resignal = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = has_queued.recv() => {
                tick.notify_one();
                resignal.reset();
            }
            _ = resignal.tick() => {
                tick.notify_one();
            }
        }
    }
}

async fn engine_loop(
    pool: Arc<ObjectPool>,
    options: DispatchOptions,
    tx: mpsc::Sender<Arc<Claim>>,
    tick: Arc<Notify>,
) {
    let backoff = pool.settings().retry_backoff();
    let outstanding = Arc::new(AtomicUsize::new(0));

    loop {
        let available = options
            .max_claimed_count
            .saturating_sub(outstanding.load(Ordering::Acquire));
        if available > 0 {
            if let Some(seed) = &options.seed {
                let seed_pool = Arc::clone(&pool);
                let objects = seed.objects.clone();
                let tags = seed.tags.clone();
                retry_forever("seed queue", backoff, move || {
                    let pool = Arc::clone(&seed_pool);
                    let objects = objects.clone();
                    let tags = tags.clone();
                    async move {
                        pool.queue_tagged(&tags, &objects, Duration::ZERO)
                            .await
                            .map(|_| ())
                    }
                })
                .await;
            }

            let claims: Vec<Arc<Claim>> = match &options.tag {
                Some(tag) => {
                    let claim_pool = Arc::clone(&pool);
                    let tag = tag.clone();
                    let max_objects = options.max_objects_per_claim;
                    retry_forever("claim tagged", backoff, move || {
                        let pool = Arc::clone(&claim_pool);
                        let tag = tag.clone();
                        async move { pool.claim_tagged(&tag, max_objects).await }
                    })
                    .await
                    .into_iter()
                    .collect()
                }
                None => {
                    let claim_pool = Arc::clone(&pool);
                    retry_forever("claim", backoff, move || {
                        let pool = Arc::clone(&claim_pool);
                        async move { pool.claim(available).await }
                    })
                    .await
                }
            };

            if !claims.is_empty() {
                debug!(
                    pool = %pool.name(),
                    emitted = claims.len(),
                    outstanding = outstanding.load(Ordering::Acquire) + claims.len(),
                    "dispatching claims"
                );
            }

            for claim in claims {
                outstanding.fetch_add(1, Ordering::AcqRel);
                pool.metrics().incr_outstanding(pool.name());

                // Watch the state channel rather than the claim itself,
                // so a claim dropped before delivery can still expire.
                let mut states = claim.subscribe();
                let watcher_outstanding = Arc::clone(&outstanding);
                let watcher_tick = Arc::clone(&tick);
                let metrics = pool.metrics().clone();
                let pool_name = pool.name().to_string();
                tokio::spawn(async move {
                    // A dropped claim counts as settled too.
                    let _ = states.wait_for(|s| s.is_terminal()).await;
                    metrics.decr_outstanding(&pool_name);
                    // The "last claim done" edge: only a drop to zero
                    // re-triggers the engine.
                    if watcher_outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        watcher_tick.notify_one();
                    }
                });

                if tx.send(claim).await.is_err() {
                    return;
                }
            }
        }

        tick.notified().await;
    }
}
