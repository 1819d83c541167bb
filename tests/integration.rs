use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mom_pubsub::{
    //
    BrokerClient,
    BrokerOperation,
    BusConfig,
    BusError,
    HandlerError,
    HandlerSettings,
    MemoryBroker,
    MessageHandler,
    Properties,
    ReceiveStrategy,
    ReceivedMessage,
    Result,
    SendResult,
    ServiceBus,
    ServiceBusBuilder,
    SubscriptionState,
    COMPETING_PREFIX,
    MAX_DELIVERY_COUNT_EXCEEDED,
};

const TOPIC: &str = "orders";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

/// One handled delivery: order id, delivery count, metadata.
type Entry = (u64, u32, Properties);

#[derive(Clone, Default)]
struct Journal {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Journal {
    fn record(&self, msg: &ReceivedMessage<OrderPlaced>) {
        self.entries.lock().unwrap().push((
            msg.message.order_id,
            msg.delivery_count(),
            msg.metadata.clone(),
        ));
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }
}

/// Records every message and succeeds.
struct Recorder {
    journal: Journal,
}

#[async_trait::async_trait]
impl MessageHandler<OrderPlaced> for Recorder {
    async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> std::result::Result<(), HandlerError> {
        self.journal.record(&msg);
        Ok(())
    }
}

/// Fails every delivery.
struct Rejecting {
    journal: Journal,
}

#[async_trait::async_trait]
impl MessageHandler<OrderPlaced> for Rejecting {
    fn settings() -> HandlerSettings {
        HandlerSettings::default().with_max_delivery_count(3)
    }

    async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> std::result::Result<(), HandlerError> {
        self.journal.record(&msg);
        Err("order rejected".into())
    }
}

/// Fails the first delivery of every message.
struct FlakyOnce {
    journal: Journal,
}

#[async_trait::async_trait]
impl MessageHandler<OrderPlaced> for FlakyOnce {
    async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> std::result::Result<(), HandlerError> {
        self.journal.record(&msg);
        if msg.delivery_count() == 1 {
            return Err("not yet".into());
        }
        Ok(())
    }
}

/// Shared by every application instance.
struct Fulfilment {
    journal: Journal,
}

#[async_trait::async_trait]
impl MessageHandler<OrderPlaced> for Fulfilment {
    fn settings() -> HandlerSettings {
        HandlerSettings::default().with_competing(true)
    }

    async fn handle(&self, msg: ReceivedMessage<OrderPlaced>) -> std::result::Result<(), HandlerError> {
        self.journal.record(&msg);
        Ok(())
    }
}

/// Built by the bus itself.
#[derive(Default)]
struct Shipping;

#[async_trait::async_trait]
impl MessageHandler<OrderShipped> for Shipping {
    async fn handle(&self, _msg: ReceivedMessage<OrderShipped>) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

fn config(application_id: &str, strategy: ReceiveStrategy) -> BusConfig {
    BusConfig::new(application_id, TOPIC)
        .with_receive_strategy(strategy)
        .with_receive_wait(Duration::from_millis(100))
        .with_error_restart_delay(Duration::from_millis(50))
        .with_cancel_poll(40, Duration::from_millis(50))
}

async fn build_bus(broker: &Arc<MemoryBroker>, application_id: &str, strategy: ReceiveStrategy) -> ServiceBus {
    // ---
    ServiceBusBuilder::new(broker.clone())
        .config(config(application_id, strategy))
        .build()
        .await
        .expect("bus should build")
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    // ---
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn subscribe_recorder(bus: &ServiceBus) -> Journal {
    // ---
    let journal = Journal::default();
    bus.registry().register_instance(Recorder {
        journal: journal.clone(),
    });
    assert!(bus.subscribe_registered::<OrderPlaced, Recorder>().await.unwrap());
    journal
}

// --- delivery

async fn every_message_is_handled_once(strategy: ReceiveStrategy) -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", strategy).await;
    let journal = subscribe_recorder(&bus).await;
    let name = bus.active_subscriptions()[0].clone();

    for order_id in 0..10 {
        bus.send(OrderPlaced { order_id }).await?;
    }

    assert!(eventually(|| journal.len() == 10).await, "handled {}", journal.len());
    assert!(eventually(|| broker.active_message_count(TOPIC, &name) == 0).await);

    let mut ids: Vec<u64> = journal.entries().iter().map(|(id, _, _)| *id).collect();
    ids.sort();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
    assert!(journal.entries().iter().all(|(_, count, _)| *count == 1));

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_every_message_is_handled_once() -> Result<()> {
    every_message_is_handled_once(ReceiveStrategy::Pull).await
}

#[tokio::test]
async fn test_push_every_message_is_handled_once() -> Result<()> {
    every_message_is_handled_once(ReceiveStrategy::Push).await
}

async fn failing_message_is_dead_lettered(strategy: ReceiveStrategy) -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", strategy).await;
    let journal = Journal::default();
    bus.registry().register_instance(Rejecting {
        journal: journal.clone(),
    });
    bus.subscribe_registered::<OrderPlaced, Rejecting>().await?;
    let name = bus.active_subscriptions()[0].clone();

    bus.send(OrderPlaced { order_id: 42 }).await?;

    assert!(eventually(|| broker.dead_letters(TOPIC, &name).len() == 1).await);
    let dead = broker.dead_letters(TOPIC, &name);
    assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
    assert!(dead[0].description.contains("order rejected"));

    let counts: Vec<u32> = journal.entries().iter().map(|(_, count, _)| *count).collect();
    assert_eq!(counts, vec![1, 2, 3]);

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_failing_message_is_dead_lettered() -> Result<()> {
    failing_message_is_dead_lettered(ReceiveStrategy::Pull).await
}

#[tokio::test]
async fn test_push_failing_message_is_dead_lettered() -> Result<()> {
    failing_message_is_dead_lettered(ReceiveStrategy::Push).await
}

async fn failed_delivery_is_retried(strategy: ReceiveStrategy) -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", strategy).await;
    let journal = Journal::default();
    bus.registry().register_instance(FlakyOnce {
        journal: journal.clone(),
    });
    bus.subscribe_registered::<OrderPlaced, FlakyOnce>().await?;
    let name = bus.active_subscriptions()[0].clone();

    bus.send(OrderPlaced { order_id: 7 }).await?;

    assert!(eventually(|| journal.len() == 2).await);
    assert!(eventually(|| broker.active_message_count(TOPIC, &name) == 0).await);
    let counts: Vec<u32> = journal.entries().iter().map(|(_, count, _)| *count).collect();
    assert_eq!(counts, vec![1, 2]);
    assert!(broker.dead_letters(TOPIC, &name).is_empty());

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_failed_delivery_is_retried() -> Result<()> {
    failed_delivery_is_retried(ReceiveStrategy::Pull).await
}

#[tokio::test]
async fn test_push_failed_delivery_is_retried() -> Result<()> {
    failed_delivery_is_retried(ReceiveStrategy::Push).await
}

// --- lifecycle

async fn unsubscribe_stops_delivery(strategy: ReceiveStrategy) -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", strategy).await;
    let journal = subscribe_recorder(&bus).await;

    for order_id in 0..3 {
        bus.send(OrderPlaced { order_id }).await?;
    }
    assert!(eventually(|| journal.len() == 3).await);

    tokio::time::timeout(WAIT, bus.unsubscribe::<OrderPlaced, Recorder>())
        .await
        .expect("unsubscribe should return within the cancellation bound")?;

    assert_eq!(bus.subscription_state::<OrderPlaced, Recorder>(), SubscriptionState::Absent);
    assert!(!bus.is_subscribed::<OrderPlaced, Recorder>());
    assert!(bus.active_subscriptions().is_empty());
    assert!(eventually(|| broker.subscription_names(TOPIC).is_empty()).await);

    bus.send(OrderPlaced { order_id: 99 }).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(journal.len(), 3);

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_unsubscribe_stops_delivery() -> Result<()> {
    unsubscribe_stops_delivery(ReceiveStrategy::Pull).await
}

#[tokio::test]
async fn test_push_unsubscribe_stops_delivery() -> Result<()> {
    unsubscribe_stops_delivery(ReceiveStrategy::Push).await
}

async fn deleted_subscription_is_recreated(strategy: ReceiveStrategy) -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", strategy).await;
    let journal = subscribe_recorder(&bus).await;
    let name = bus.active_subscriptions()[0].clone();

    // Someone deletes the subscription behind the bus's back
    broker.delete_subscription(TOPIC, &name).await.unwrap();

    assert!(eventually(|| broker.subscription_names(TOPIC) == vec![name.clone()]).await);

    bus.send(OrderPlaced { order_id: 1 }).await?;
    assert!(eventually(|| journal.len() == 1).await);
    assert!(bus.is_subscribed::<OrderPlaced, Recorder>());

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pull_deleted_subscription_is_recreated() -> Result<()> {
    deleted_subscription_is_recreated(ReceiveStrategy::Pull).await
}

#[tokio::test]
async fn test_push_deleted_subscription_is_recreated() -> Result<()> {
    deleted_subscription_is_recreated(ReceiveStrategy::Push).await
}

#[tokio::test]
async fn test_subscribe_is_idempotent() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Pull).await;

    assert!(bus.subscribe::<OrderShipped, Shipping>().await?);
    assert!(!bus.subscribe::<OrderShipped, Shipping>().await?);

    assert_eq!(bus.active_subscriptions().len(), 1);
    assert_eq!(broker.subscription_names(TOPIC).len(), 1);
    assert!(bus.active_subscriptions()[0].starts_with("billing_"));
    assert!(bus.registry().is_registered::<Shipping>());

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_subscribe_registered_requires_registration() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Pull).await;

    let err = bus.subscribe_registered::<OrderPlaced, Recorder>().await.unwrap_err();

    assert!(matches!(err, BusError::Configuration(_)));
    assert!(broker.subscription_names(TOPIC).is_empty());
}

#[tokio::test]
async fn test_competing_and_exclusive_naming() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let first = build_bus(&broker, "svc-a", ReceiveStrategy::Pull).await;
    let second = build_bus(&broker, "svc-b", ReceiveStrategy::Push).await;

    let shared = Journal::default();
    for bus in [&first, &second] {
        bus.registry().register_instance(Fulfilment {
            journal: shared.clone(),
        });
        bus.subscribe_registered::<OrderPlaced, Fulfilment>().await?;
        bus.subscribe::<OrderShipped, Shipping>().await?;
    }

    let names = broker.subscription_names(TOPIC);
    assert_eq!(names.len(), 3, "{names:?}");
    assert_eq!(names.iter().filter(|n| n.starts_with(COMPETING_PREFIX)).count(), 1);
    assert!(names.iter().any(|n| n.starts_with("svc-a_")));
    assert!(names.iter().any(|n| n.starts_with("svc-b_")));
    assert!(names.iter().all(|n| n.len() <= mom_pubsub::MAX_SUBSCRIPTION_NAME_LEN));

    // Competing consumers split the work: every order is handled exactly once
    for order_id in 0..6 {
        first.send(OrderPlaced { order_id }).await?;
    }
    assert!(eventually(|| shared.len() == 6).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(shared.len(), 6);

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

// --- sending

#[tokio::test]
async fn test_metadata_reaches_handler() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Pull).await;
    let journal = subscribe_recorder(&bus).await;

    let mut metadata = Properties::new();
    metadata.insert("tenant".into(), "acme".into());
    let id = bus.send_with_metadata(OrderPlaced { order_id: 5 }, metadata).await?;

    assert!(eventually(|| journal.len() == 1).await);
    let (order_id, _, received) = journal.entries().remove(0);
    assert_eq!(order_id, 5);
    assert_eq!(received.get("tenant"), Some(&"acme".into()));
    assert!(!id.as_str().is_empty());

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_send_async_calls_back_with_state() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Pull).await;
    let (tx, rx) = tokio::sync::oneshot::channel();

    let id = bus.send_async(
        OrderPlaced { order_id: 8 },
        "checkout",
        move |result: SendResult<&'static str>| {
            let _ = tx.send(result);
        },
        Properties::new(),
    )?;

    let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(result.success);
    assert!(result.error.is_none());
    assert_eq!(result.state, "checkout");
    assert_eq!(result.message_id, id);

    bus.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_refuses_further_work() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Push).await;
    let _journal = subscribe_recorder(&bus).await;

    bus.shutdown().await;

    assert!(bus.active_subscriptions().is_empty());
    assert!(matches!(
        bus.send(OrderPlaced { order_id: 1 }).await,
        Err(BusError::ShutDown)
    ));
    assert!(matches!(
        bus.subscribe::<OrderShipped, Shipping>().await,
        Err(BusError::ShutDown)
    ));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_cancels_subscribe_in_flight() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = build_bus(&broker, "billing", ReceiveStrategy::Pull).await;
    broker.delay_next(BrokerOperation::GetSubscription, Duration::from_millis(300));

    let (subscribed, ()) = tokio::join!(bus.subscribe::<OrderShipped, Shipping>(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.shutdown().await;
    });

    // Either refused outright or provisioned and then cancelled by shutdown.
    match subscribed {
        Ok(_) | Err(BusError::ShutDown) => {}
        Err(err) => panic!("unexpected subscribe error: {err}"),
    }
    assert!(bus.active_subscriptions().is_empty());
    assert!(!bus.is_subscribed::<OrderShipped, Shipping>());
    assert!(broker.subscription_names(TOPIC).is_empty());
    Ok(())
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
