//! High-level pool operations.
//!
//! `ObjectPool` wraps a `PoolClient` with the fixed lease TTL from
//! settings, wraps claimed batches in `Claim`s, and threads operation
//! metrics. Streams of claims are produced by the dispatch engine
//! (`crate::dispatch`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::claim::Claim;
use crate::client::{PoolClient, PoolError, PoolStatus};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::metrics::PoolMetrics;
use crate::settings::PoolSettings;

/// A named, isolated object queue with its own keyspace.
pub struct ObjectPool {
    name: String,
    client: Arc<PoolClient>,
    settings: PoolSettings,
    metrics: PoolMetrics,
}

impl ObjectPool {
    /// Connect to the store and set up a pool with its own metrics
    /// registry.
    pub async fn connect(name: &str, settings: PoolSettings) -> Result<Arc<Self>, PoolError> {
        let metrics = PoolMetrics::new()?;
        Self::connect_with_metrics(name, settings, metrics).await
    }

    /// Connect to the store, recording metrics on a shared handle.
    pub async fn connect_with_metrics(
        name: &str,
        settings: PoolSettings,
        metrics: PoolMetrics,
    ) -> Result<Arc<Self>, PoolError> {
        let client = PoolClient::connect(name, &settings.url, settings.retry_backoff()).await?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            client,
            settings,
            metrics,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<PoolClient> {
        &self.client
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Queue objects for immediate claim. Returns the objects that were
    /// not already tracked.
    pub async fn queue(&self, objects: &[String]) -> Result<Vec<String>, PoolError> {
        self.queue_tagged(&HashMap::new(), objects, Duration::ZERO)
            .await
    }

    /// Queue objects carrying tag assignments, optionally delayed.
    pub async fn queue_tagged(
        &self,
        tags: &HashMap<String, String>,
        objects: &[String],
        delay: Duration,
    ) -> Result<Vec<String>, PoolError> {
        let added = self.client.queue_tagged(tags, objects, delay).await?;
        self.metrics.record_queued(&self.name, added.len() as u64);
        Ok(added)
    }

    /// Claim up to `max_count` objects, one `Claim` per object. The
    /// batch shares one session id but every object has its own lease
    /// key, so each claim extends and settles independently.
    pub async fn claim(&self, max_count: usize) -> Result<Vec<Arc<Claim>>, PoolError> {
        let batch = self
            .client
            .claim(max_count, self.settings.claim_ttl(), None)
            .await?;
        self.metrics
            .record_claimed(&self.name, batch.objects.len() as u64);
        let claims = batch
            .objects
            .into_iter()
            .map(|object| {
                Claim::new(
                    Arc::clone(&self.client),
                    vec![object],
                    batch.session.clone(),
                    self.settings.claim_ttl(),
                    self.settings.retry_backoff(),
                    self.metrics.clone(),
                )
            })
            .collect();
        Ok(claims)
    }

    /// Claim a batch of up to `max_objects` objects sharing the head
    /// object's value for `tag`, wrapped in a single `Claim` with one
    /// terminal fate.
    pub async fn claim_tagged(
        &self,
        tag: &str,
        max_objects: usize,
    ) -> Result<Option<Arc<Claim>>, PoolError> {
        let batch = self
            .client
            .claim(max_objects, self.settings.claim_ttl(), Some(tag))
            .await?;
        if batch.objects.is_empty() {
            return Ok(None);
        }
        self.metrics
            .record_claimed(&self.name, batch.objects.len() as u64);
        Ok(Some(Claim::new(
            Arc::clone(&self.client),
            batch.objects,
            batch.session,
            self.settings.claim_ttl(),
            self.settings.retry_backoff(),
            self.metrics.clone(),
        )))
    }

    /// Requeue expired leases and promote matured delays. Returns the
    /// union of both.
    pub async fn clean(&self) -> Result<Vec<String>, PoolError> {
        let mut moved = self.client.clean_expired().await?;
        let promoted = self.client.clean_delayed().await?;
        self.metrics
            .record_cleaned(&self.name, moved.len() as u64, promoted.len() as u64);
        if !moved.is_empty() || !promoted.is_empty() {
            debug!(
                pool = %self.name,
                reclaimed = moved.len(),
                promoted = promoted.len(),
                "clean moved objects back to the queue"
            );
        }
        moved.extend(promoted);
        Ok(moved)
    }

    /// Advisory size snapshot.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        self.client.status().await
    }

    /// Start a dispatcher emitting a bounded stream of claims from this
    /// pool.
    pub fn dispatch(self: &Arc<Self>, options: DispatchOptions) -> Dispatcher {
        Dispatcher::start(Arc::clone(self), options)
    }
}
