//! Claim lifecycle: lease auto-extension and serialized terminal
//! transitions.
//!
//! A `Claim` owns one leased batch of objects. Its state machine admits a
//! new action only from `Claimed`; every transition runs under a per-claim
//! mutex so concurrent callers serialize, and terminal transitions run in
//! a spawned task so an abandoned caller cannot cancel the store call
//! mid-retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::PoolClient;
use crate::metrics::PoolMetrics;
use crate::retry::retry_forever;

/// Phase of one claim's lifecycle. `Released`, `Requeued` and `Expired`
/// are terminal; the state channel never changes after entering one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Claimed,
    Extending,
    Releasing,
    Requeuing,
    Released,
    Requeued,
    Expired,
}

impl ClaimState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClaimState::Released | ClaimState::Requeued | ClaimState::Expired
        )
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::Extending => write!(f, "Extending"),
            ClaimState::Releasing => write!(f, "Releasing"),
            ClaimState::Requeuing => write!(f, "Requeuing"),
            ClaimState::Released => write!(f, "Released"),
            ClaimState::Requeued => write!(f, "Requeued"),
            ClaimState::Expired => write!(f, "Expired"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Extend,
    Release,
    Requeue(Duration),
}

impl Action {
    fn active_state(self) -> ClaimState {
        match self {
            Action::Extend => ClaimState::Extending,
            Action::Release => ClaimState::Releasing,
            Action::Requeue(_) => ClaimState::Requeuing,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Action::Extend => "extend",
            Action::Release => "release",
            Action::Requeue(_) => "requeue",
        }
    }
}

struct ClaimInner {
    objects: Vec<String>,
    session: String,
    client: Arc<PoolClient>,
    ttl: Duration,
    backoff: Duration,
    metrics: PoolMetrics,
    state: watch::Sender<ClaimState>,
    transitions: Arc<Mutex<()>>,
    rearmed: Notify,
}

impl ClaimInner {
    /// Run one transition. Holds the per-claim mutex for the whole store
    /// round trip; the body is spawned so that dropping the caller's
    /// future leaves the retry loop running to completion.
    async fn transition(self: &Arc<Self>, action: Action) -> bool {
        let guard = Arc::clone(&self.transitions).lock_owned().await;
        if *self.state.borrow() != ClaimState::Claimed {
            return false;
        }

        let inner = Arc::clone(self);
        let handle: JoinHandle<bool> = tokio::spawn(async move {
            let _guard = guard;
            inner.state.send_replace(action.active_state());

            let ok = retry_forever(action.name(), inner.backoff, {
                let inner = Arc::clone(&inner);
                move || {
                    let inner = Arc::clone(&inner);
                    async move {
                        match action {
                            Action::Extend => {
                                inner
                                    .client
                                    .extend(&inner.objects, &inner.session, inner.ttl)
                                    .await
                            }
                            Action::Release => {
                                inner.client.release(&inner.objects, &inner.session).await
                            }
                            Action::Requeue(delay) => {
                                inner
                                    .client
                                    .requeue(&inner.objects, &inner.session, delay)
                                    .await
                            }
                        }
                    }
                }
            })
            .await;

            let next = match (action, ok) {
                (Action::Extend, true) => ClaimState::Claimed,
                (Action::Release, true) => ClaimState::Released,
                (Action::Requeue(_), true) => ClaimState::Requeued,
                (_, false) => ClaimState::Expired,
            };
            debug!(
                pool = %inner.client.name(),
                session = %inner.session,
                action = action.name(),
                ok,
                state = %next,
                "claim transition"
            );
            match next {
                ClaimState::Released => inner
                    .metrics
                    .record_released(inner.client.name(), inner.objects.len() as u64),
                ClaimState::Requeued => inner
                    .metrics
                    .record_requeued(inner.client.name(), inner.objects.len() as u64),
                _ => {}
            }
            inner.state.send_replace(next);
            if next == ClaimState::Claimed {
                inner.rearmed.notify_waiters();
            }
            ok
        });

        handle.await.unwrap_or(false)
    }
}

/// One leased batch of objects and the session that owns it.
///
/// A claim always holds at least one object. Dropping the claim stops its
/// auto-extension, after which the lease runs out and the janitor returns
/// the objects to the queue.
pub struct Claim {
    inner: Arc<ClaimInner>,
    extender: JoinHandle<()>,
}

impl Claim {
    pub(crate) fn new(
        client: Arc<PoolClient>,
        objects: Vec<String>,
        session: String,
        ttl: Duration,
        backoff: Duration,
        metrics: PoolMetrics,
    ) -> Arc<Self> {
        debug_assert!(!objects.is_empty(), "claims must hold at least one object");
        let (state, _) = watch::channel(ClaimState::Claimed);
        let inner = Arc::new(ClaimInner {
            objects,
            session,
            client,
            ttl,
            backoff,
            metrics,
            state,
            transitions: Arc::new(Mutex::new(())),
            rearmed: Notify::new(),
        });
        let extender = tokio::spawn(auto_extend(Arc::clone(&inner)));
        Arc::new(Self { inner, extender })
    }

    /// The full leased batch, in claim order.
    pub fn objects(&self) -> &[String] {
        &self.inner.objects
    }

    /// The first object of the batch.
    pub fn object(&self) -> &str {
        &self.inner.objects[0]
    }

    pub fn session(&self) -> &str {
        &self.inner.session
    }

    pub fn state(&self) -> ClaimState {
        *self.inner.state.borrow()
    }

    /// Watch the claim's state. The receiver sees every settled state;
    /// terminal states are final.
    pub fn subscribe(&self) -> watch::Receiver<ClaimState> {
        self.inner.state.subscribe()
    }

    /// Wait until the claim reaches a terminal state.
    pub async fn done(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Reset the lease TTL. Returns false (and expires the claim) if the
    /// session no longer holds every object.
    pub async fn extend(&self) -> bool {
        self.inner.transition(Action::Extend).await
    }

    /// Permanently remove the batch from the pool.
    pub async fn release(&self) -> bool {
        self.inner.transition(Action::Release).await
    }

    /// Return the batch to the queue for future reclaim.
    pub async fn requeue(&self) -> bool {
        self.inner.transition(Action::Requeue(Duration::ZERO)).await
    }

    /// Return the batch to the queue after a delay.
    pub async fn requeue_delayed(&self, delay: Duration) -> bool {
        self.inner.transition(Action::Requeue(delay)).await
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.extender.abort();
    }
}

/// Heartbeat loop: fire an extend at half the TTL, restarting the timer
/// whenever a manual extend lands. Ends on any terminal state.
async fn auto_extend(inner: Arc<ClaimInner>) {
    let mut state_rx = inner.state.subscribe();
    let half = inner.ttl / 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(half) => {
                if !inner.transition(Action::Extend).await {
                    break;
                }
            }
            _ = inner.rearmed.notified() => {}
            _ = state_rx.changed() => {
                if state_rx.borrow().is_terminal() {
                    break;
                }
            }
        }
    }
}
