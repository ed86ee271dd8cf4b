//! Process-wide pool registry and the janitor.
//!
//! The registry is the one piece of module-level state in the system; it
//! is an explicit value owned by the host rather than a language-level
//! global. Starting the janitor once covers every pool registered now or
//! later.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::pool::ObjectPool;

pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<ObjectPool>>>,
    added: broadcast::Sender<Arc<ObjectPool>>,
}

impl PoolRegistry {
    pub fn new() -> Arc<Self> {
        let (added, _) = broadcast::channel(64);
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            added,
        })
    }

    /// Register a pool. Idempotent: a pool whose name is already
    /// registered is ignored.
    pub fn add(&self, pool: Arc<ObjectPool>) {
        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(pool.name()) {
            return;
        }
        pools.insert(pool.name().to_string(), Arc::clone(&pool));
        drop(pools);
        // No receiver before the janitor starts; the snapshot covers that.
        let _ = self.added.send(pool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ObjectPool>> {
        self.pools.read().unwrap().get(name).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<ObjectPool>> {
        self.pools.read().unwrap().values().cloned().collect()
    }

    /// Start the janitor: one clean loop per registered pool, picking up
    /// pools registered later. Each loop ticks at a third of the pool's
    /// claim TTL; a tick that lands while a clean is still running is
    /// dropped. Stops when the returned handle is dropped or stopped.
    pub fn start_janitor(self: &Arc<Self>) -> JanitorHandle {
        let registry = Arc::downgrade(self);
        let rx = self.added.subscribe();
        let task = tokio::spawn(janitor_loop(registry, rx));
        JanitorHandle { task }
    }
}

pub struct JanitorHandle {
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn janitor_loop(
    registry: Weak<PoolRegistry>,
    mut added: broadcast::Receiver<Arc<ObjectPool>>,
) {
    let mut loops: JoinSet<()> = JoinSet::new();
    let mut covered: HashSet<String> = HashSet::new();

    // Reconcile against the registry so a lagged broadcast cannot leave a
    // pool without a janitor.
    let reconcile = |loops: &mut JoinSet<()>, covered: &mut HashSet<String>| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        for pool in registry.snapshot() {
            if covered.insert(pool.name().to_string()) {
                debug!(pool = %pool.name(), "janitor covering pool");
                loops.spawn(clean_loop(pool));
            }
        }
    };

    reconcile(&mut loops, &mut covered);
    loop {
        match added.recv().await {
            Ok(pool) => {
                if covered.insert(pool.name().to_string()) {
                    debug!(pool = %pool.name(), "janitor covering pool");
                    loops.spawn(clean_loop(pool));
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                reconcile(&mut loops, &mut covered);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn clean_loop(pool: Arc<ObjectPool>) {
    let mut interval = tokio::time::interval(pool.settings().clean_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = pool.clean().await {
            // The next tick retries; a wedged store must not pile up
            // concurrent cleans.
            warn!(pool = %pool.name(), error = %err, "janitor clean failed");
        }
    }
}
