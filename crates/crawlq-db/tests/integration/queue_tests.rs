use std::time::Duration;

use crawlq_core::error::AppError;
use crawlq_core::queue::{Delivery, MessageQueue};
use crawlq_core::task::Task;
use crawlq_db::{PgMessageQueue, QueueConfig};
use tokio_util::sync::CancellationToken;

use crate::integration::common::setup_test_db;

const QUEUE: &str = "parser_queue";

fn config() -> QueueConfig {
    QueueConfig::default()
        .with_name(QUEUE)
        .with_poll_interval(Duration::from_millis(50))
}

fn body(url: &str) -> Vec<u8> {
    Task::new(url, "hackernews", 1).to_message().unwrap()
}

#[tokio::test]
async fn declare_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());

    queue.declare_queue(QUEUE).await.unwrap();
    queue.declare_queue(QUEUE).await.unwrap();
}

#[tokio::test]
async fn publish_to_undeclared_queue_fails() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());

    let err = queue.publish("missing", b"{}", true).await.unwrap_err();
    assert!(matches!(err, AppError::QueueError(ref m) if m.contains("not declared")));

    let err = queue
        .consume("missing", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QueueError(_)));
}

#[tokio::test]
async fn claim_returns_messages_in_publish_order() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());
    queue.declare_queue(QUEUE).await.unwrap();

    queue.publish(QUEUE, &body("https://a.test/1"), true).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/2"), true).await.unwrap();

    let first = queue.claim(QUEUE).await.unwrap().expect("first message");
    let second = queue.claim(QUEUE).await.unwrap().expect("second message");
    assert!(queue.claim(QUEUE).await.unwrap().is_none());

    assert_eq!(Task::from_message(first.body()).unwrap().url, "https://a.test/1");
    assert_eq!(Task::from_message(second.body()).unwrap().url, "https://a.test/2");
    assert_eq!(first.delivery_count(), 1);
}

#[tokio::test]
async fn success_removes_message() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());
    queue.declare_queue(QUEUE).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/"), true).await.unwrap();

    let delivery = queue.claim(QUEUE).await.unwrap().unwrap();
    delivery.success().await.unwrap();

    assert_eq!(queue.depth(QUEUE).await.unwrap(), (0, 0, 0));
}

#[tokio::test]
async fn try_again_redelivers() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());
    queue.declare_queue(QUEUE).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/"), true).await.unwrap();

    let delivery = queue.claim(QUEUE).await.unwrap().unwrap();
    delivery.try_again().await.unwrap();

    let again = queue.claim(QUEUE).await.unwrap().expect("requeued");
    assert_eq!(again.delivery_count(), 2);
}

#[tokio::test]
async fn reject_dead_letters_message() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());
    queue.declare_queue(QUEUE).await.unwrap();
    queue.publish(QUEUE, b"not json", true).await.unwrap();

    let delivery = queue.claim(QUEUE).await.unwrap().unwrap();
    delivery.reject().await.unwrap();

    assert!(queue.claim(QUEUE).await.unwrap().is_none());
    assert_eq!(queue.depth(QUEUE).await.unwrap(), (0, 0, 1));
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_ack_fails() {
    let (pool, _container) = setup_test_db().await;
    let short = config().with_lease(Duration::from_millis(200));
    let slow = PgMessageQueue::new(pool.clone(), short.clone());
    let other = PgMessageQueue::new(pool, short);
    slow.declare_queue(QUEUE).await.unwrap();
    slow.publish(QUEUE, &body("https://a.test/"), true).await.unwrap();

    let stale = slow.claim(QUEUE).await.unwrap().unwrap();
    assert!(other.claim(QUEUE).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let reclaimed = other.claim(QUEUE).await.unwrap().expect("lease expired");
    assert_eq!(reclaimed.delivery_count(), 2);

    let err = stale.success().await.unwrap_err();
    assert!(matches!(err, AppError::QueueError(ref m) if m.contains("lease lost")));
    reclaimed.success().await.unwrap();
}

#[tokio::test]
async fn consume_streams_deliveries_until_cancelled() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config().with_prefetch(1));
    queue.declare_queue(QUEUE).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = queue.consume(QUEUE, cancel.clone()).await.unwrap();

    queue.publish(QUEUE, &body("https://a.test/1"), true).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/2"), false).await.unwrap();

    for expected in ["https://a.test/1", "https://a.test/2"] {
        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open");
        assert_eq!(Task::from_message(delivery.body()).unwrap().url, expected);
        delivery.success().await.unwrap();
    }

    cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("poller stops");
    assert!(closed.is_none());
}

#[tokio::test]
async fn release_unacked_returns_buffered_messages() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config());
    queue.declare_queue(QUEUE).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/"), true).await.unwrap();

    let held = queue.claim(QUEUE).await.unwrap().unwrap();
    assert_eq!(queue.release_unacked().await.unwrap(), 1);
    drop(held);

    assert_eq!(queue.depth(QUEUE).await.unwrap(), (1, 0, 0));
}

#[tokio::test]
async fn buffered_claims_are_released_after_poller_stops() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgMessageQueue::new(pool, config().with_prefetch(1));
    queue.declare_queue(QUEUE).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/1"), true).await.unwrap();
    queue.publish(QUEUE, &body("https://a.test/2"), true).await.unwrap();

    let cancel = CancellationToken::new();
    let rx = queue.consume(QUEUE, cancel.clone()).await.unwrap();

    // One claim fills the channel; nobody reads it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.depth(QUEUE).await.unwrap().1 == 0 {
        assert!(tokio::time::Instant::now() < deadline, "poller never claimed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    queue.join_pollers().await;
    assert_eq!(queue.release_unacked().await.unwrap(), 1);
    drop(rx);

    assert_eq!(queue.depth(QUEUE).await.unwrap(), (2, 0, 0));
}
