use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use courier_api::{BoxFuture, Message, Publication, StorageBackend, StorageError, now_ms};
use courier_engine::{Broker, BrokerError, BrokerOptions, CancellationToken, ErrorCode, IdGenerator};
use courier_storage_memory::MemoryStorage;

fn memory_broker(options: BrokerOptions) -> (Broker, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let broker = Broker::new(storage.clone(), IdGenerator::new(), options);
    (broker, storage)
}

fn live_only(subscriber_buffer: usize) -> BrokerOptions {
    BrokerOptions {
        subscriber_buffer,
        replay_backlog: false,
        ..BrokerOptions::default()
    }
}

async fn recv_soon(subscription: &mut courier_engine::Subscription) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(50), subscription.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test(start_paused = true)]
async fn publish_fetch_and_expire() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let a = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    assert_eq!(a, 1);
    assert_eq!(broker.fetch(&cancel, "orders", a).await.unwrap().body, "A");

    let b = broker
        .publish(&cancel, "orders", Publication::new("B").with_ttl_secs(2))
        .await
        .unwrap();
    assert_eq!(b, 2);
    assert_eq!(broker.fetch(&cancel, "orders", b).await.unwrap().body, "B");
    assert_eq!(broker.scheduler().pending(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let err = broker.fetch(&cancel, "orders", b).await.unwrap_err();
    assert!(matches!(err, BrokerError::ExpiredId { id: 2, .. }));
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = broker.fetch(&cancel, "orders", 99).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidId { id: 99, .. }));

    // No TTL: still there.
    assert_eq!(broker.fetch(&cancel, "orders", a).await.unwrap().body, "A");
}

#[tokio::test]
async fn ttl_beyond_clock_range_never_expires() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let id = broker
        .publish(&cancel, "orders", Publication::new("A").with_ttl_secs(i64::MAX))
        .await
        .unwrap();
    assert_eq!(broker.fetch(&cancel, "orders", id).await.unwrap().body, "A");
    assert_eq!(broker.scheduler().pending(), 0);
}

#[tokio::test]
async fn ttl_beyond_millisecond_range_is_fetchable() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let id = broker
        .publish(
            &cancel,
            "orders",
            Publication::new("A").with_ttl_secs(10_000_000_000_000_000),
        )
        .await
        .unwrap();
    assert_eq!(broker.fetch(&cancel, "orders", id).await.unwrap().body, "A");
}

#[tokio::test]
async fn overdue_unswept_message_is_neither_fetched_nor_replayed() {
    let (broker, storage) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    // Stored five seconds ago with a one second TTL; never scheduled.
    let stale = Message::new(
        50,
        "orders",
        Publication::new("stale").with_ttl_secs(1),
        now_ms() - 5_000,
    );
    storage.add_message(&stale).await.unwrap();
    let fresh = Message::new(51, "orders", Publication::new("fresh"), now_ms());
    storage.add_message(&fresh).await.unwrap();

    assert!(matches!(
        broker.fetch(&cancel, "orders", 50).await.unwrap_err(),
        BrokerError::ExpiredId { id: 50, .. }
    ));

    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();
    assert_eq!(subscription.recv().await.unwrap().id, 51);
    assert!(recv_soon(&mut subscription).await.is_none());
}

#[tokio::test]
async fn ids_increase_across_subjects() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let mut prev = 0;
    for i in 0..20 {
        let subject = if i % 2 == 0 { "orders" } else { "invoices" };
        let id = broker
            .publish(&cancel, subject, Publication::new(format!("m{i}")))
            .await
            .unwrap();
        assert!(id > prev);
        prev = id;
    }
}

#[tokio::test]
async fn fetch_is_scoped_to_subject() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let id = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    let err = broker.fetch(&cancel, "invoices", id).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidId { .. }));
    assert_eq!(broker.registry().len(), 2);
}

#[tokio::test]
async fn closed_broker_is_unavailable() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();
    broker.close().await.unwrap();
    assert!(broker.is_closed());

    let err = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unavailable));
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert!(matches!(
        broker.subscribe(&cancel, "orders").await.unwrap_err(),
        BrokerError::Unavailable
    ));
    assert!(matches!(
        broker.fetch(&cancel, "orders", 1).await.unwrap_err(),
        BrokerError::Unavailable
    ));
    assert!(matches!(broker.close().await.unwrap_err(), BrokerError::Unavailable));
}

#[tokio::test]
async fn close_ends_live_subscriptions() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();
    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();

    broker.close().await.unwrap();
    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn subscribers_see_only_later_publishes_without_replay() {
    let (broker, _) = memory_broker(live_only(8));
    let cancel = CancellationToken::new();

    let mut early = broker.subscribe(&cancel, "orders").await.unwrap();
    let first = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    let mut late = broker.subscribe(&cancel, "orders").await.unwrap();
    let second = broker
        .publish(&cancel, "orders", Publication::new("B"))
        .await
        .unwrap();

    assert_eq!(early.recv().await.unwrap().id, first);
    assert_eq!(early.recv().await.unwrap().id, second);
    assert_eq!(late.recv().await.unwrap().id, second);
    assert!(recv_soon(&mut late).await.is_none());
}

#[tokio::test]
async fn other_subjects_are_not_delivered() {
    let (broker, _) = memory_broker(live_only(8));
    let cancel = CancellationToken::new();

    let mut orders = broker.subscribe(&cancel, "orders").await.unwrap();
    broker
        .publish(&cancel, "invoices", Publication::new("X"))
        .await
        .unwrap();
    assert!(recv_soon(&mut orders).await.is_none());
}

#[tokio::test]
async fn full_subscriber_does_not_block_publisher() {
    let (broker, _) = memory_broker(live_only(2));
    let cancel = CancellationToken::new();

    let mut slow = broker.subscribe(&cancel, "orders").await.unwrap();
    let mut fast = broker.subscribe(&cancel, "orders").await.unwrap();

    let mut ids = Vec::new();
    for body in ["1", "2", "3"] {
        let id = tokio::time::timeout(
            Duration::from_secs(1),
            broker.publish(&cancel, "orders", Publication::new(body)),
        )
        .await
        .expect("publish blocked")
        .unwrap();
        assert_eq!(fast.recv().await.unwrap().id, id);
        ids.push(id);
    }

    assert_eq!(slow.recv().await.unwrap().id, ids[0]);
    assert_eq!(slow.recv().await.unwrap().id, ids[1]);
    assert!(recv_soon(&mut slow).await.is_none());

    // The dropped message is still stored.
    assert_eq!(broker.fetch(&cancel, "orders", ids[2]).await.unwrap().body, "3");
}

#[tokio::test]
async fn backlog_is_replayed_before_live_messages() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    let a = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    let b = broker
        .publish(&cancel, "orders", Publication::new("B"))
        .await
        .unwrap();

    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();
    let c = broker
        .publish(&cancel, "orders", Publication::new("C"))
        .await
        .unwrap();

    assert_eq!(subscription.recv().await.unwrap().id, a);
    assert_eq!(subscription.recv().await.unwrap().id, b);
    assert_eq!(subscription.recv().await.unwrap().id, c);
    assert!(recv_soon(&mut subscription).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn expired_messages_are_not_replayed() {
    let (broker, _) = memory_broker(BrokerOptions::default());
    let cancel = CancellationToken::new();

    broker
        .publish(&cancel, "orders", Publication::new("gone").with_ttl_secs(1))
        .await
        .unwrap();
    let kept = broker
        .publish(&cancel, "orders", Publication::new("kept"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();
    assert_eq!(subscription.recv().await.unwrap().id, kept);
    assert!(recv_soon(&mut subscription).await.is_none());
}

/// Memory storage whose backlog read waits for a signal, so a publish can
/// land between subscriber registration and the backlog read.
struct GatedBacklog {
    inner: MemoryStorage,
    gate: Arc<Notify>,
}

impl StorageBackend for GatedBacklog {
    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.inner.init()
    }

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        self.inner.last_id()
    }

    fn add_message(&self, message: &Message) -> BoxFuture<'_, Result<u64, StorageError>> {
        self.inner.add_message(message)
    }

    fn fetch_message(&self, id: u64, subject: &str) -> BoxFuture<'_, Result<Message, StorageError>> {
        self.inner.fetch_message(id, subject)
    }

    fn delete_message(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<(), StorageError>> {
        self.inner.delete_message(subject, id)
    }

    fn messages_by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            self.gate.notified().await;
            self.inner.messages_by_subject(&subject).await
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.inner.flush()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.inner.close()
    }
}

#[tokio::test]
async fn backlog_and_live_copies_are_not_duplicated() {
    let gate = Arc::new(Notify::new());
    let storage = Arc::new(GatedBacklog {
        inner: MemoryStorage::new(),
        gate: gate.clone(),
    });
    let broker = Arc::new(Broker::new(storage, IdGenerator::new(), BrokerOptions::default()));
    let cancel = CancellationToken::new();

    let pending = tokio::spawn({
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        async move { broker.subscribe(&cancel, "orders").await }
    });
    let topic = broker.registry().get_or_create("orders");
    while topic.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    // Delivered live and also present in the backlog read below.
    let a = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    gate.notify_one();
    let mut subscription = pending.await.unwrap().unwrap();

    let b = broker
        .publish(&cancel, "orders", Publication::new("B"))
        .await
        .unwrap();

    assert_eq!(subscription.recv().await.unwrap().id, a);
    assert_eq!(subscription.recv().await.unwrap().id, b);
    assert!(recv_soon(&mut subscription).await.is_none());
}

#[tokio::test]
async fn cancelled_token_rejects_and_ends_subscription() {
    let (broker, _) = memory_broker(live_only(8));
    let cancel = CancellationToken::new();

    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();
    broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap();
    cancel.cancel();

    assert!(subscription.recv().await.is_none());
    let err = broker
        .publish(&cancel, "orders", Publication::new("B"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Cancelled));
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(matches!(
        broker.fetch(&cancel, "orders", 1).await.unwrap_err(),
        BrokerError::Cancelled
    ));
}

#[tokio::test]
async fn dropping_subscription_deregisters() {
    let (broker, _) = memory_broker(live_only(8));
    let cancel = CancellationToken::new();

    let subscription = broker.subscribe(&cancel, "orders").await.unwrap();
    let topic = broker.registry().get_or_create("orders");
    assert_eq!(topic.subscriber_count(), 1);
    drop(subscription);
    assert_eq!(topic.subscriber_count(), 0);
}

#[tokio::test]
async fn storage_failure_still_delivers_live() {
    let (broker, storage) = memory_broker(live_only(8));
    let cancel = CancellationToken::new();
    let mut subscription = broker.subscribe(&cancel, "orders").await.unwrap();

    storage.close().await.unwrap();
    let err = broker
        .publish(&cancel, "orders", Publication::new("A"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Storage(_)));
    assert_eq!(err.code(), ErrorCode::Internal);

    let delivered = subscription.recv().await.unwrap();
    assert_eq!(delivered.body, "A");
}
