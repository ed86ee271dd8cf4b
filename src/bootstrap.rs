//! Processor host: wires registered processors to pools and runs the
//! janitor.
//!
//! The host is the seam to the application container: it consumes
//! registration descriptors, starts one dispatcher per processor at
//! bootstrap, and hands every emitted claim to the processor. A claim the
//! processor leaves unsettled is requeued on its behalf, which keeps the
//! work available by default.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::claim::Claim;
use crate::dispatch::{DispatchOptions, SeedQueue};
use crate::registry::{JanitorHandle, PoolRegistry};

/// A user-supplied handler for claims from one pool.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle one claim. Call `claim.release()` to consume the objects
    /// or `claim.requeue()` to hand them back; returning without doing
    /// either requeues the claim.
    async fn process(&self, claim: &Claim) -> anyhow::Result<()>;
}

/// Registration descriptor binding a processor to a pool.
#[derive(Debug, Clone)]
pub struct ProcessorSpec {
    /// Name of the pool to consume from; must be registered at bootstrap.
    pub pool: String,
    /// Maximum number of concurrently outstanding claims.
    pub max_claimed_count: usize,
    /// When set, claims are tagged batches.
    pub tag: Option<String>,
    /// Batch size limit for tagged claims.
    pub max_objects_per_claim: Option<usize>,
    /// Objects re-queued before every claim attempt.
    pub seed: Option<SeedQueue>,
}

impl ProcessorSpec {
    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_claimed_count: self.max_claimed_count.max(1),
            tag: self.tag.clone(),
            max_objects_per_claim: self.max_objects_per_claim.unwrap_or(1).max(1),
            seed: self.seed.clone(),
        }
    }
}

struct Running {
    janitor: JanitorHandle,
    workers: Vec<JoinHandle<()>>,
}

/// Host for a set of processors over a pool registry.
pub struct Host {
    registry: Arc<PoolRegistry>,
    processors: Vec<(ProcessorSpec, Arc<dyn Processor>)>,
    running: Option<Running>,
}

impl Host {
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            processors: Vec::new(),
            running: None,
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Register a processor to be started at bootstrap.
    pub fn register(&mut self, spec: ProcessorSpec, processor: Arc<dyn Processor>) {
        self.processors.push((spec, processor));
    }

    /// Start the janitor and one dispatcher per registered processor.
    /// A processor referring to an unknown pool is skipped with a
    /// warning rather than failing the host.
    pub fn bootstrap(&mut self) {
        if self.running.is_some() {
            return;
        }
        let janitor = self.registry.start_janitor();
        let mut workers = Vec::new();

        for (spec, processor) in &self.processors {
            let Some(pool) = self.registry.get(&spec.pool) else {
                warn!(pool = %spec.pool, "processor refers to an unregistered pool, skipping");
                continue;
            };
            let mut dispatcher = pool.dispatch(spec.dispatch_options());
            let processor = Arc::clone(processor);
            let pool_name = spec.pool.clone();
            workers.push(tokio::spawn(async move {
                while let Some(claim) = dispatcher.next_claim().await {
                    let processor = Arc::clone(&processor);
                    let pool_name = pool_name.clone();
                    // Claims are handled concurrently up to the
                    // dispatcher's outstanding cap.
                    tokio::spawn(async move {
                        if let Err(err) = processor.process(&claim).await {
                            warn!(
                                pool = %pool_name,
                                session = %claim.session(),
                                error = %err,
                                "processor failed, requeueing claim"
                            );
                        }
                        if !claim.state().is_terminal() {
                            let requeued = claim.requeue().await;
                            debug!(
                                pool = %pool_name,
                                session = %claim.session(),
                                requeued,
                                "claim left unsettled by processor"
                            );
                        }
                    });
                }
            }));
        }

        self.running = Some(Running { janitor, workers });
    }

    /// Stop the janitor and every dispatcher. Claims already handed to
    /// processors finish their own terminal transitions.
    pub fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            running.janitor.stop();
            for worker in running.workers {
                worker.abort();
            }
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}
