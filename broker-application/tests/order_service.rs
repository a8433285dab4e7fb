use anyhow::Result as AnyResult;
use broker_application::{AppConfig, AppError, BrokerService, OrderHandlers};
use broker_runtime::transport::{QueueOptions, Transport};
use broker_runtime::{
    BrokerConfig, BrokerError, EventType, InMemoryBroker, OrderEvent, RedeliveryPolicy,
    SubscriptionState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn start(broker: &InMemoryBroker, config: AppConfig) -> AnyResult<(BrokerService, OrderHandlers)> {
    let handlers = OrderHandlers::default();
    let service = BrokerService::start(config, Arc::new(broker.clone()), handlers.clone()).await?;
    for stats in service.stats() {
        let queue = stats.queue.clone();
        wait_until(|| {
            service
                .stats()
                .iter()
                .any(|s| s.queue == queue && s.state == SubscriptionState::Consuming)
        })
        .await;
    }
    Ok((service, handlers))
}

#[tokio::test(flavor = "multi_thread")]
async fn order_lifecycle_reaches_every_subscriber() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let (service, handlers) = start(&broker, AppConfig::default()).await?;
    assert_eq!(
        service.registrations(),
        vec![
            ("notification_queue".to_string(), "order.*".to_string()),
            ("order_processing_queue".to_string(), "order.created".to_string()),
            ("payment_verification_queue".to_string(), "payment.*".to_string()),
            ("shipping_queue".to_string(), "order.shipped".to_string()),
        ]
    );

    let publisher = service.publisher();
    let created = OrderEvent::new("O-1", EventType::OrderCreated, &json!({"total": 30}), "")?;
    let paid = OrderEvent::new("O-1", EventType::PaymentVerified, &json!({"amount": 30.0}), "")?;
    let shipped = OrderEvent::new("O-1", EventType::OrderShipped, &json!({}), "Parcel left the warehouse")?;
    publisher.publish_event(&created, "order.created").await?;
    publisher.publish_event(&paid, "payment.verified").await?;
    publisher.publish_event(&shipped, "order.shipped").await?;

    wait_until(|| handlers.notification.sent().len() == 2).await;
    wait_until(|| handlers.shipping.shipped_at("O-1").is_some()).await;
    wait_until(|| handlers.payment_verification.verified("O-1").is_some()).await;
    wait_until(|| handlers.order_processing.is_accepted("O-1")).await;

    let texts: Vec<String> = handlers.notification.sent().into_iter().map(|n| n.text).collect();
    assert!(texts.contains(&"Your order O-1 has been received.".to_string()));
    assert!(texts.contains(&"Parcel left the warehouse".to_string()));
    assert_eq!(handlers.shipping.shipped_at("O-1"), Some(shipped.timestamp()));

    service.shutdown().await?;
    assert_eq!(broker.open_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_is_processed_once() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let (service, handlers) = start(&broker, AppConfig::default()).await?;

    let shipped = OrderEvent::new("O-2", EventType::OrderShipped, &json!({}), "")?;
    let publisher = service.publisher();
    publisher.publish_event(&shipped, "order.shipped").await?;
    publisher.publish_event(&shipped, "order.shipped").await?;

    wait_until(|| {
        service
            .stats()
            .iter()
            .find(|s| s.queue == "shipping_queue")
            .is_some_and(|s| s.acked == 2)
    })
    .await;
    assert_eq!(handlers.shipping.shipment_count(), 1);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_payment_is_dead_lettered() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let config = AppConfig {
        redelivery: RedeliveryPolicy::DeadLetter { max_attempts: 3 },
        ..AppConfig::default()
    };
    let (service, handlers) = start(&broker, config).await?;

    let bogus = OrderEvent::new("O-3", EventType::PaymentVerified, &json!({"amount": -5}), "")?;
    service.publisher().publish_event(&bogus, "payment.verified").await?;

    wait_until(|| broker.ready_count("payment_verification_queue.dead_letter") == 1).await;
    let stats = service
        .stats()
        .into_iter()
        .find(|s| s.queue == "payment_verification_queue")
        .unwrap();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert!(handlers.payment_verification.verified("O-3").is_none());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_queue_surfaces_subscriber_failure() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    {
        // 另一个进程以不同参数声明过同名队列
        let conn = broker.connect(&BrokerConfig::default()).await?;
        let channel = conn.open_channel().await?;
        let options = QueueOptions {
            durable: true,
            dead_letter_exchange: Some("x.dlx".into()),
        };
        channel.declare_queue("shipping_queue", &options).await?;
        conn.close().await?;
    }

    let service = BrokerService::start(
        AppConfig::default(),
        Arc::new(broker.clone()),
        OrderHandlers::default(),
    )
    .await?;

    tokio::time::timeout(
        Duration::from_secs(5),
        service.subscriber_failure_signal().cancelled(),
    )
    .await?;

    let failures = service.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_fatal());
    assert!(matches!(&failures[0], AppError::Subscriber { queue, .. } if queue == "shipping_queue"));
    assert!(!service.fatal_signal().is_cancelled());

    let others = service
        .stats()
        .into_iter()
        .filter(|s| s.queue != "shipping_queue")
        .collect::<Vec<_>>();
    assert_eq!(others.len(), 3);
    for stats in &others {
        let queue = stats.queue.clone();
        wait_until(|| {
            service
                .stats()
                .iter()
                .any(|s| s.queue == queue && s.state == SubscriptionState::Consuming)
        })
        .await;
    }

    service.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_fails_startup() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);

    let err = BrokerService::start(AppConfig::default(), Arc::new(broker.clone()), OrderHandlers::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::Broker(BrokerError::Connection { attempts: 5, .. })));
    assert!(err.is_fatal());
    assert_eq!(broker.connect_attempts(), 5);
}
