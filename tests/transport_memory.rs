// tests/transport_memory.rs

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use mom_pubsub::{
    // ---
    BrokerClient,
    BrokerError,
    BrokerOperation,
    DeliveryMode,
    MemoryBroker,
    MessageId,
    OutboundEnvelope,
    Properties,
    PumpEvent,
    PumpOptions,
    SubscriptionClientHandle,
    SubscriptionDescription,
    SubscriptionFilter,
    TopicHandle,
    MAX_DELIVERY_COUNT_EXCEEDED,
    TTL_EXPIRED,
};

const TOPIC: &str = "orders";
const ORDER_PLACED: &str = "orders_OrderPlaced";
const ORDER_SHIPPED: &str = "orders_OrderShipped";

fn description(name: &str) -> SubscriptionDescription {
    SubscriptionDescription {
        topic_path: TOPIC.into(),
        name: name.into(),
        default_message_ttl: None,
        lock_duration: Duration::from_secs(30),
        max_delivery_count: 10,
        dead_letter_on_expiration: false,
        enable_batched_operations: true,
    }
}

fn envelope(type_tag: &str, body: &'static [u8]) -> OutboundEnvelope {
    OutboundEnvelope::new(
        MessageId::generate(),
        type_tag,
        Bytes::from_static(body),
        &Properties::new(),
    )
}

async fn setup(
    description: SubscriptionDescription,
    mode: DeliveryMode,
) -> (Arc<MemoryBroker>, TopicHandle, SubscriptionClientHandle) {
    // ---
    let broker = MemoryBroker::new();
    let topic = TopicHandle::from(broker.create_topic(TOPIC).await.unwrap());
    broker
        .create_subscription(&description, &SubscriptionFilter::type_equals(ORDER_PLACED))
        .await
        .unwrap();
    let client = broker
        .create_subscription_client(&description, mode, 0)
        .await
        .unwrap();
    (broker, topic, client)
}

#[tokio::test]
async fn memory_peek_lock_hides_message_until_completed() {
    // ---
    // Arrange
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"one")).await.unwrap();

    // ---
    // Act
    // ---
    let first = broker
        .receive(&client, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("message should be delivered");
    let hidden = broker.receive(&client, Duration::from_millis(20)).await.unwrap();

    // ---
    // Assert
    // ---
    assert!(hidden.is_none(), "locked message was handed out twice");
    assert_eq!(first.delivery_count, 1);
    assert_eq!(first.body, Bytes::from_static(b"one"));
    assert_eq!(broker.active_message_count(TOPIC, "billing"), 1);

    let token = first.lock_token.expect("peek-lock delivers a lock token");
    broker.complete(&client, &token).await.unwrap();
    assert_eq!(broker.active_message_count(TOPIC, "billing"), 0);

    let again = broker.complete(&client, &token).await.unwrap_err();
    assert!(matches!(again, BrokerError::LockLost(_)));
}

#[tokio::test]
async fn memory_abandon_redelivers_then_dead_letters_at_max() {
    // ---
    let mut desc = description("billing");
    desc.max_delivery_count = 2;
    let (broker, topic, client) = setup(desc, DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"poison")).await.unwrap();

    let first = broker.receive(&client, Duration::from_millis(50)).await.unwrap().unwrap();
    broker.abandon(&client, first.lock_token.as_ref().unwrap()).await.unwrap();

    let second = broker.receive(&client, Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.delivery_count, 2);
    broker.abandon(&client, second.lock_token.as_ref().unwrap()).await.unwrap();

    assert!(broker.receive(&client, Duration::from_millis(20)).await.unwrap().is_none());

    let dead = broker.dead_letters(TOPIC, "billing");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, first.id);
    assert_eq!(dead[0].delivery_count, 2);
    assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
}

#[tokio::test]
async fn memory_explicit_dead_letter_keeps_reason_and_description() {
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"bad")).await.unwrap();

    let message = broker.receive(&client, Duration::from_millis(50)).await.unwrap().unwrap();
    broker
        .dead_letter(&client, message.lock_token.as_ref().unwrap(), "Rejected", "bad payload")
        .await
        .unwrap();

    let dead = broker.dead_letters(TOPIC, "billing");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "Rejected");
    assert_eq!(dead[0].description, "bad payload");
    assert_eq!(broker.active_message_count(TOPIC, "billing"), 0);
}

#[tokio::test(start_paused = true)]
async fn memory_expired_lock_makes_message_visible_again() {
    // ---
    let mut desc = description("billing");
    desc.lock_duration = Duration::from_millis(100);
    let (broker, topic, client) = setup(desc, DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"slow")).await.unwrap();

    let first = broker.receive(&client, Duration::from_millis(10)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = broker.receive(&client, Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.delivery_count, 2);

    let stale = broker
        .complete(&client, first.lock_token.as_ref().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(stale, BrokerError::LockLost(_)));
    broker.complete(&client, second.lock_token.as_ref().unwrap()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn memory_expired_message_is_dead_lettered_when_enabled() {
    // ---
    let mut desc = description("billing");
    desc.default_message_ttl = Some(Duration::from_millis(100));
    desc.dead_letter_on_expiration = true;
    let (broker, topic, client) = setup(desc, DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"stale")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(broker.receive(&client, Duration::from_millis(10)).await.unwrap().is_none());
    let dead = broker.dead_letters(TOPIC, "billing");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, TTL_EXPIRED);
}

#[tokio::test(start_paused = true)]
async fn memory_expired_message_is_dropped_by_default() {
    // ---
    let mut desc = description("billing");
    desc.default_message_ttl = Some(Duration::from_millis(100));
    let (broker, topic, client) = setup(desc, DeliveryMode::PeekLock).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"stale")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(broker.receive(&client, Duration::from_millis(10)).await.unwrap().is_none());
    assert!(broker.dead_letters(TOPIC, "billing").is_empty());
    assert_eq!(broker.active_message_count(TOPIC, "billing"), 0);
}

#[tokio::test]
async fn memory_send_routes_by_filter() {
    // ---
    let (broker, topic, _) = setup(description("placed"), DeliveryMode::PeekLock).await;
    broker
        .create_subscription(&description("shipped"), &SubscriptionFilter::type_equals(ORDER_SHIPPED))
        .await
        .unwrap();

    broker.send(&topic, envelope(ORDER_PLACED, b"p1")).await.unwrap();
    broker.send(&topic, envelope(ORDER_PLACED, b"p2")).await.unwrap();
    broker.send(&topic, envelope(ORDER_SHIPPED, b"s1")).await.unwrap();
    broker.send(&topic, envelope("orders_Unrelated", b"u1")).await.unwrap();

    assert_eq!(broker.active_message_count(TOPIC, "placed"), 2);
    assert_eq!(broker.active_message_count(TOPIC, "shipped"), 1);
    assert_eq!(broker.subscription_names(TOPIC), vec!["placed", "shipped"]);
}

#[tokio::test]
async fn memory_receive_and_delete_has_no_lock() {
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::ReceiveAndDelete).await;
    broker.send(&topic, envelope(ORDER_PLACED, b"once")).await.unwrap();

    let message = broker.receive(&client, Duration::from_millis(50)).await.unwrap().unwrap();

    assert!(message.lock_token.is_none());
    assert_eq!(broker.active_message_count(TOPIC, "billing"), 0);
}

#[tokio::test]
async fn memory_create_twice_reports_already_exists() {
    // ---
    let (broker, _, _) = setup(description("billing"), DeliveryMode::PeekLock).await;

    let topic_err = broker.create_topic(TOPIC).await.unwrap_err();
    let sub_err = broker
        .create_subscription(&description("billing"), &SubscriptionFilter::type_equals(ORDER_PLACED))
        .await
        .unwrap_err();

    assert!(matches!(topic_err, BrokerError::AlreadyExists(_)));
    assert!(matches!(sub_err, BrokerError::AlreadyExists(_)));
    assert!(broker.subscription_exists(TOPIC, "billing").await.unwrap());
    assert!(!broker.subscription_exists(TOPIC, "nobody").await.unwrap());
}

#[tokio::test]
async fn memory_injected_faults_are_consumed_in_order() {
    // ---
    let (broker, _, _) = setup(description("billing"), DeliveryMode::PeekLock).await;
    broker.fail_next(BrokerOperation::GetSubscription, BrokerError::ServerBusy("busy".into()));
    broker.fail_next(BrokerOperation::GetSubscription, BrokerError::Timeout("slow".into()));

    let first = broker.get_subscription(TOPIC, "billing").await.unwrap_err();
    let second = broker.get_subscription(TOPIC, "billing").await.unwrap_err();
    let third = broker.get_subscription(TOPIC, "billing").await;

    assert!(matches!(first, BrokerError::ServerBusy(_)));
    assert!(matches!(second, BrokerError::Timeout(_)));
    assert_eq!(third.unwrap().name, "billing");
    assert_eq!(broker.call_count(BrokerOperation::GetSubscription), 3);
}

#[tokio::test]
async fn memory_pump_pushes_messages_and_reports_deletion() {
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::PeekLock).await;
    let options = PumpOptions {
        max_concurrent_calls: 2,
        wait: Duration::from_millis(20),
    };
    let mut pump = broker.on_message(&client, options).await.unwrap();

    broker.send(&topic, envelope(ORDER_PLACED, b"pushed")).await.unwrap();

    let event = timeout(Duration::from_secs(1), pump.inbox.recv())
        .await
        .expect("timed out waiting for pushed message")
        .expect("pump closed unexpectedly");
    let PumpEvent::Message(message) = event else {
        panic!("expected a message, got {event:?}");
    };
    assert_eq!(message.body, Bytes::from_static(b"pushed"));
    broker.complete(&client, message.lock_token.as_ref().unwrap()).await.unwrap();

    broker.delete_subscription(TOPIC, "billing").await.unwrap();

    let event = timeout(Duration::from_secs(1), pump.inbox.recv())
        .await
        .expect("timed out waiting for the deletion fault")
        .expect("pump closed before reporting the deletion");
    assert!(matches!(event, PumpEvent::Error(BrokerError::NotFound(_))));
}

#[tokio::test]
async fn memory_dropped_pump_hands_message_back() {
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::PeekLock).await;
    let options = PumpOptions {
        max_concurrent_calls: 1,
        wait: Duration::from_millis(20),
    };
    let pump = broker.on_message(&client, options).await.unwrap();
    drop(pump);

    broker.send(&topic, envelope(ORDER_PLACED, b"late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let message = broker.receive(&client, Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(message.body, Bytes::from_static(b"late"));
}

#[tokio::test]
async fn memory_closed_broker_rejects_calls() {
    // ---
    let (broker, topic, client) = setup(description("billing"), DeliveryMode::PeekLock).await;

    broker.close().await.unwrap();

    assert!(matches!(
        broker.send(&topic, envelope(ORDER_PLACED, b"x")).await,
        Err(BrokerError::Closed)
    ));
    assert!(matches!(
        broker.receive(&client, Duration::from_millis(10)).await,
        Err(BrokerError::Closed)
    ));
}

#[tokio::test]
async fn memory_delayed_operation_is_held_then_served() {
    // ---
    let (broker, _topic, _client) = setup(description("billing"), DeliveryMode::PeekLock).await;
    broker.delay_next(BrokerOperation::DeleteSubscription, Duration::from_millis(200));

    let started = tokio::time::Instant::now();
    broker.delete_subscription(TOPIC, "billing").await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(broker.subscription_names(TOPIC).is_empty());

    // Only the next call is held.
    let started = tokio::time::Instant::now();
    let err = broker.delete_subscription(TOPIC, "billing").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert!(started.elapsed() < Duration::from_millis(200));
}
