
use std::time::Duration;

use corral::dispatch::{DispatchOptions, SeedQueue};

use test_helpers::*;

/// Scenario: with a cap of 2, exactly two claims are outstanding and a
/// third is dispatched only after one of them settles.
#[corral::test]
async fn dispatcher_caps_outstanding_claims() {
    with_timeout!(30000, {
        let mut settings = test_settings();
        settings.resignal_secs = 1;
        let Some(pool) = open_test_pool_with("dispatch-cap", settings).await else {
            return;
        };

        let mut dispatcher = pool.dispatch(DispatchOptions {
            max_claimed_count: 2,
            ..DispatchOptions::default()
        });
        // Let the queued-notification subscription establish first.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let objects: Vec<String> = (0..10).map(|i| format!("o{i}")).collect();
        pool.queue(&objects).await.expect("queue");

        let first = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("first claim")
            .expect("stream open");
        let second = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("second claim")
            .expect("stream open");
        assert_ne!(first.object(), second.object());

        // At the cap: no third claim while both are outstanding.
        assert!(
            tokio::time::timeout(Duration::from_millis(700), dispatcher.next_claim())
                .await
                .is_err(),
            "third claim must wait for a terminal state"
        );

        assert!(first.release().await);
        let third = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("third claim after release")
            .expect("stream open");
        assert_ne!(third.object(), second.object());

        assert!(second.release().await);
        assert!(third.release().await);
    });
}

/// The last-claim-done edge re-triggers the engine without waiting for
/// the periodic resignal.
#[corral::test]
async fn last_claim_done_edge_retriggers() {
    with_timeout!(30000, {
        let mut settings = test_settings();
        settings.resignal_secs = 60;
        let Some(pool) = open_test_pool_with("dispatch-edge", settings).await else {
            return;
        };

        let mut dispatcher = pool.dispatch(DispatchOptions {
            max_claimed_count: 1,
            ..DispatchOptions::default()
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.queue(&objs(&["a", "b"])).await.expect("queue");

        let first = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("first claim")
            .expect("stream open");

        assert!(
            tokio::time::timeout(Duration::from_millis(700), dispatcher.next_claim())
                .await
                .is_err()
        );

        assert!(first.release().await);
        let second = tokio::time::timeout(Duration::from_secs(2), dispatcher.next_claim())
            .await
            .expect("second claim should follow the zero edge")
            .expect("stream open");
        assert!(second.release().await);
    });
}

/// Work queued after the dispatcher starts is picked up via the
/// queued-notification channel.
#[corral::test]
async fn notification_wakes_idle_dispatcher() {
    with_timeout!(30000, {
        let mut settings = test_settings();
        settings.resignal_secs = 60;
        let Some(pool) = open_test_pool_with("dispatch-notify", settings).await else {
            return;
        };

        let mut dispatcher = pool.dispatch(DispatchOptions::default());
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.queue(&objs(&["x"])).await.expect("queue");

        let claim = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("claim after notification")
            .expect("stream open");
        assert_eq!(claim.object(), "x");
        assert!(claim.release().await);
    });
}

/// Tagged dispatch wraps a whole co-located batch in one claim.
#[corral::test]
async fn tagged_dispatcher_emits_batches() {
    with_timeout!(30000, {
        let Some(pool) = open_test_pool("dispatch-tagged").await else {
            return;
        };

        pool.queue_tagged(
            &tag_map(&[("g", "v")]),
            &objs(&["a", "b", "c"]),
            Duration::ZERO,
        )
        .await
        .expect("queue");

        let mut dispatcher = pool.dispatch(DispatchOptions {
            max_claimed_count: 1,
            tag: Some("g".to_string()),
            max_objects_per_claim: 3,
            seed: None,
        });

        let claim = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("batched claim")
            .expect("stream open");
        assert_eq!(claim.objects(), objs(&["a", "b", "c"]).as_slice());
        assert!(claim.release().await);
    });
}

/// Seed objects are re-queued before every claim attempt, so released
/// work reappears: the self-priming processor idiom.
#[corral::test]
async fn seeded_dispatcher_replenishes_released_work() {
    with_timeout!(30000, {
        let Some(pool) = open_test_pool("dispatch-seed").await else {
            return;
        };

        let mut dispatcher = pool.dispatch(DispatchOptions {
            max_claimed_count: 1,
            seed: Some(SeedQueue {
                objects: objs(&["seed"]),
                tags: tag_map(&[]),
            }),
            ..DispatchOptions::default()
        });

        let first = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("seeded claim")
            .expect("stream open");
        assert_eq!(first.object(), "seed");
        assert!(first.release().await);

        let second = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_claim())
            .await
            .expect("reseeded claim")
            .expect("stream open");
        assert_eq!(second.object(), "seed");
        assert!(second.release().await);
    });
}
