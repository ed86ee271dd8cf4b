
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral::bootstrap::{Host, Processor, ProcessorSpec};
use corral::claim::Claim;
use corral::registry::PoolRegistry;
use tokio::sync::mpsc;

use test_helpers::*;

struct Releasing {
    seen: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Processor for Releasing {
    async fn process(&self, claim: &Claim) -> anyhow::Result<()> {
        let _ = self.seen.send(claim.object().to_string());
        claim.release().await;
        Ok(())
    }
}

struct Ignoring {
    seen: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Processor for Ignoring {
    async fn process(&self, claim: &Claim) -> anyhow::Result<()> {
        let _ = self.seen.send(claim.object().to_string());
        // Neither release nor requeue: the host requeues on our behalf.
        Ok(())
    }
}

fn spec_for(pool: &str, max_claimed_count: usize) -> ProcessorSpec {
    ProcessorSpec {
        pool: pool.to_string(),
        max_claimed_count,
        tag: None,
        max_objects_per_claim: None,
        seed: None,
    }
}

/// The host claims queued work, hands it to the processor, and the
/// released objects leave the pool for good.
#[corral::test]
async fn host_runs_processor_to_completion() {
    with_timeout!(30000, {
        let mut settings = test_settings();
        settings.resignal_secs = 1;
        let Some(pool) = open_test_pool_with("host-run", settings).await else {
            return;
        };

        let registry = PoolRegistry::new();
        registry.add(Arc::clone(&pool));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut host = Host::new(Arc::clone(&registry));
        host.register(
            spec_for(pool.name(), 2),
            Arc::new(Releasing { seen: seen_tx }),
        );
        host.bootstrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.queue(&objs(&["a", "b"])).await.expect("queue");

        let mut seen = Vec::new();
        for _ in 0..2 {
            let object = tokio::time::timeout(Duration::from_secs(10), seen_rx.recv())
                .await
                .expect("processor should receive work")
                .expect("channel open");
            seen.push(object);
        }
        seen.sort();
        assert_eq!(seen, objs(&["a", "b"]));

        // Released objects disappear from the pool entirely.
        let mut total = u64::MAX;
        for _ in 0..50 {
            total = pool.status().await.expect("status").total;
            if total == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(total, 0);

        host.shutdown();
    });
}

/// A claim the processor leaves unsettled is requeued by the host and
/// comes around again.
#[corral::test]
async fn unsettled_claims_are_requeued_and_redelivered() {
    with_timeout!(30000, {
        let mut settings = test_settings();
        settings.resignal_secs = 1;
        let Some(pool) = open_test_pool_with("host-requeue", settings).await else {
            return;
        };

        let registry = PoolRegistry::new();
        registry.add(Arc::clone(&pool));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut host = Host::new(Arc::clone(&registry));
        host.register(
            spec_for(pool.name(), 1),
            Arc::new(Ignoring { seen: seen_tx }),
        );
        host.bootstrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.queue(&objs(&["a"])).await.expect("queue");

        for round in 0..2 {
            let object = tokio::time::timeout(Duration::from_secs(10), seen_rx.recv())
                .await
                .unwrap_or_else(|_| panic!("delivery {round} should arrive"))
                .expect("channel open");
            assert_eq!(object, "a");
        }

        // Still tracked: requeue keeps the work available.
        let status = pool.status().await.expect("status");
        assert_eq!(status.total, 1);

        host.shutdown();
    });
}

/// A processor naming an unknown pool is skipped without failing the
/// rest of the host.
#[corral::test]
async fn unknown_pool_is_skipped() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("host-unknown").await else {
            return;
        };

        let registry = PoolRegistry::new();
        registry.add(Arc::clone(&pool));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (known_tx, mut known_rx) = mpsc::unbounded_channel();
        let mut host = Host::new(Arc::clone(&registry));
        host.register(
            spec_for("corral-test-no-such-pool", 1),
            Arc::new(Releasing { seen: seen_tx }),
        );
        host.register(
            spec_for(pool.name(), 1),
            Arc::new(Releasing { seen: known_tx }),
        );
        host.bootstrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.queue(&objs(&["a"])).await.expect("queue");

        let object = tokio::time::timeout(Duration::from_secs(10), known_rx.recv())
            .await
            .expect("known pool processor should run")
            .expect("channel open");
        assert_eq!(object, "a");
        assert!(seen_rx.try_recv().is_err());

        host.shutdown();
    });
}
