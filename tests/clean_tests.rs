
use std::time::Duration;

use corral::keys;
use redis::AsyncCommands;

use test_helpers::*;

/// An expired lease is detected by the missing session key and the
/// object returns to the queue.
#[corral::test]
async fn expired_lease_is_reclaimed() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("clean-expired").await else {
            return;
        };
        let client = pool.client();
        pool.queue(&objs(&["a"])).await.expect("queue");

        let lease = client
            .claim(1, Duration::from_secs(60), None)
            .await
            .expect("claim");
        assert_eq!(lease.objects, objs(&["a"]));

        let mut conn = raw_conn().await;
        let _: () = conn
            .del(keys::session_key(pool.name(), "a"))
            .await
            .expect("del");

        let moved = client.clean_expired().await.expect("clean");
        assert_eq!(moved, objs(&["a"]));

        let queue: Vec<String> = conn
            .lrange(keys::queue_key(pool.name()), 0, -1)
            .await
            .expect("lrange");
        assert_eq!(queue, objs(&["a"]));
        let claimed: Vec<String> = conn
            .lrange(keys::claimed_key(pool.name()), 0, -1)
            .await
            .expect("lrange");
        assert!(claimed.is_empty());
        let queued: Vec<String> = conn
            .smembers(keys::queued_key(pool.name()))
            .await
            .expect("smembers");
        assert_eq!(queued, objs(&["a"]));
    });
}

/// The cleanup walk pops only the expired prefix of the claimed list:
/// a live lease at the head shields everything behind it.
#[corral::test]
async fn clean_stops_at_first_live_lease() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("clean-prefix").await else {
            return;
        };
        let client = pool.client();
        pool.queue(&objs(&["a", "b"])).await.expect("queue");

        let _lease_a = client
            .claim(1, Duration::from_secs(60), None)
            .await
            .expect("claim");
        let _lease_b = client
            .claim(1, Duration::from_secs(60), None)
            .await
            .expect("claim");

        let mut conn = raw_conn().await;

        // Expire the later lease only: the live head ends the walk early.
        let _: () = conn
            .del(keys::session_key(pool.name(), "b"))
            .await
            .expect("del");
        assert!(client.clean_expired().await.expect("clean").is_empty());

        // Expire the head too: both fall out in list order.
        let _: () = conn
            .del(keys::session_key(pool.name(), "a"))
            .await
            .expect("del");
        let moved = client.clean_expired().await.expect("clean");
        assert_eq!(moved, objs(&["a", "b"]));
    });
}

/// Scenario: a short delay matures and cleaning promotes the object.
#[corral::test]
async fn delayed_object_promotes_after_maturity() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("clean-delayed").await else {
            return;
        };
        let client = pool.client();

        pool.queue_tagged(&tag_map(&[]), &objs(&["a"]), Duration::from_secs(1))
            .await
            .expect("queue");

        // Not yet matured.
        assert!(client.clean_delayed().await.expect("clean").is_empty());
        let status = pool.status().await.expect("status");
        assert_eq!(status.delayed, 1);
        assert_eq!(status.queued, 0);

        tokio::time::sleep(Duration::from_millis(1300)).await;

        let moved = client.clean_delayed().await.expect("clean");
        assert_eq!(moved, objs(&["a"]));

        let status = pool.status().await.expect("status");
        assert_eq!(status.delayed, 0);
        assert_eq!(status.queued, 1);
    });
}

/// clean() unions expired-lease reclaims and delay promotions.
#[corral::test]
async fn clean_unions_both_walks() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("clean-union").await else {
            return;
        };
        let client = pool.client();

        pool.queue(&objs(&["exp"])).await.expect("queue");
        let _lease = client
            .claim(1, Duration::from_secs(60), None)
            .await
            .expect("claim");
        pool.queue_tagged(&tag_map(&[]), &objs(&["slow"]), Duration::from_secs(1))
            .await
            .expect("queue");

        let mut conn = raw_conn().await;
        let _: () = conn
            .del(keys::session_key(pool.name(), "exp"))
            .await
            .expect("del");
        tokio::time::sleep(Duration::from_millis(1300)).await;

        let mut moved = pool.clean().await.expect("clean");
        moved.sort();
        assert_eq!(moved, objs(&["exp", "slow"]));

        let status = pool.status().await.expect("status");
        assert_eq!(status.queued, 2);
    });
}

/// Reclaimed tagged objects are re-indexed into their tagged queues.
#[corral::test]
async fn reclaim_rebuilds_tagged_queues() {
    with_timeout!(20000, {
        let Some(pool) = open_test_pool("clean-tagged").await else {
            return;
        };
        let client = pool.client();

        pool.queue_tagged(&tag_map(&[("t", "x")]), &objs(&["a"]), Duration::ZERO)
            .await
            .expect("queue");
        let claim = pool
            .claim_tagged("t", 5)
            .await
            .expect("claim")
            .expect("batch");
        assert_eq!(claim.objects(), objs(&["a"]).as_slice());

        let mut conn = raw_conn().await;
        let _: () = conn
            .del(keys::session_key(pool.name(), "a"))
            .await
            .expect("del");

        let moved = client.clean_expired().await.expect("clean");
        assert_eq!(moved, objs(&["a"]));

        let tagged: Vec<String> = conn
            .lrange(keys::tagged_queue_key(pool.name(), "t", "x"), 0, -1)
            .await
            .expect("lrange");
        assert_eq!(tagged, objs(&["a"]), "tagged index must be rebuilt on reclaim");
    });
}
