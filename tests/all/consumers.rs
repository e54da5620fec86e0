use crate::helpers::{
    builder, direct_exchange, eventually, eventually_async, forwarding_handler, get_consumer,
    get_pool, next_body, random_name,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use warren::amqp::memory::MemoryBroker;
use warren::amqp::session::{BindingOptions, ConsumerOptions, Exchange, ExchangeKind, Queue};
use warren::consumers::{ConnectionClosed, Consumer, Retries, DEFAULT_PREFETCH_COUNT};
use warren::pool::{Error, Role};
use warren::publishers::Producer;

#[tokio::test]
async fn a_consumer_receives_the_messages_routed_to_its_queue() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let queue = random_name();
    let consumer = get_consumer(&pool, exchange.clone(), &queue, "orders");
    let (handler, mut bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    let mut producer = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("orders"));
    producer.publish("first").await.unwrap();
    producer.publish("second").await.unwrap();

    // Assert
    assert_eq!(next_body(&mut bodies).await, b"first");
    assert_eq!(next_body(&mut bodies).await, b"second");
    assert_eq!(
        broker.bindings(),
        vec![(exchange.name.clone(), queue.clone(), "orders".to_owned())]
    );
    let consumers = pool.connections(Role::Consumer).await.unwrap();
    assert_eq!(consumers.len(), 1);
    assert_eq!(Some(consumers[0].id), consumer.connection_id());

    consumer.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn topic_bindings_match_wildcard_routing_keys() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = Exchange::new(random_name(), ExchangeKind::Topic);
    let queue = random_name();
    let consumer = get_consumer(&pool, exchange.clone(), &queue, "orders.*");
    let (handler, mut bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    let mut ignored = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("invoices.created"));
    ignored.publish("ignored").await.unwrap();
    let mut matching = Producer::new(pool.clone(), exchange, BindingOptions::new("orders.created"));
    matching.publish("matched").await.unwrap();

    // Assert
    assert_eq!(next_body(&mut bodies).await, b"matched");
    consumer.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn messages_published_before_subscribing_are_delivered_once_consuming_starts() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let queue = random_name();
    let consumer = get_consumer(&pool, exchange.clone(), &queue, "k");
    let (handler, mut bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    consumer.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();

    let mut producer = Producer::new(pool.clone(), exchange, BindingOptions::new("k"));
    producer.publish("waiting").await.unwrap();
    assert_eq!(broker.queue_depth(&queue), 1);

    // Act
    let (handler, mut later) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });

    // Assert
    assert_eq!(next_body(&mut later).await, b"waiting");
    assert_eq!(broker.queue_depth(&queue), 0);
    assert!(bodies.try_recv().is_err());
    consumer.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn consume_returns_ok_when_the_connection_is_lost() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let queue = random_name();
    let consumer = get_consumer(&pool, direct_exchange(), &queue, "k");
    let (handler, _bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    broker.disconnect_all("CONNECTION_FORCED - broker forced connection closure");

    // Assert
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let pool_handle = pool.clone();
    assert!(
        eventually_async(|| {
            let pool = pool_handle.clone();
            async move { pool.connection_count().await.unwrap() == 0 }
        })
        .await
    );
}

#[tokio::test]
async fn shutting_a_consumer_down_keeps_its_connection_and_parks_the_channel() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let queue = random_name();
    let consumer = get_consumer(&pool, direct_exchange(), &queue, "k");
    let (handler, _bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    consumer.shutdown().await.unwrap();

    // Assert
    handle.await.unwrap().unwrap();
    assert_eq!(broker.consumer_count(&queue), 0);
    let stats = pool.connections(Role::Consumer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (1, 0));
    assert!(consumer.connection_id().is_none());
    assert!(matches!(consumer.shutdown().await, Err(Error::NotBound)));
}

#[tokio::test]
async fn closing_a_consumer_tears_its_connection_down() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let queue = random_name();
    let consumer = get_consumer(&pool, direct_exchange(), &queue, "k");
    let (handler, _bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    assert_eq!(broker.open_connections(), 2);

    // Act
    consumer.close().await.unwrap();

    // Assert
    handle.await.unwrap().unwrap();
    assert!(pool.connections(Role::Consumer).await.unwrap().is_empty());
    assert_eq!(broker.open_connections(), 1);
    assert!(matches!(consumer.close().await, Err(Error::NotBound)));
}

#[tokio::test]
async fn close_handlers_run_in_registration_order() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for name in ["first", "second"] {
        let queue = random_name();
        let consumer = get_consumer(&pool, exchange.clone(), &queue, name);
        let calls = Arc::clone(&calls);
        consumer.register_closed_handler(move |event: &ConnectionClosed| {
            calls.lock().unwrap().push((name, event.reason.clone()));
        });
        let (handler, _bodies) = forwarding_handler();
        handles.push(tokio::spawn(async move { consumer.consume(handler).await }));
        assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    }
    assert_eq!(pool.connections(Role::Consumer).await.unwrap().len(), 1);

    // Act
    broker.disconnect_all("CONNECTION_FORCED");

    // Assert
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(eventually(|| calls.lock().unwrap().len() == 2).await);
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            ("first", "CONNECTION_FORCED".to_owned()),
            ("second", "CONNECTION_FORCED".to_owned())
        ]
    );
}

#[tokio::test]
async fn auto_reconnection_gives_up_after_the_configured_number_of_attempts() {
    // Arrange
    let interval = Duration::from_millis(50);
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let queue = random_name();
    let consumer = get_consumer(&pool, direct_exchange(), &queue, "k");
    consumer.register_auto_reconnection(interval, Retries::Times(3));
    let (handler, _bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    let dials_before = broker.dial_attempts().len();

    // Act
    broker.set_reachable(false);
    let lost_at = Instant::now();
    broker.disconnect_all("CONNECTION_FORCED");

    // Assert
    handle.await.unwrap().unwrap();
    assert!(eventually(|| broker.dial_attempts().len() == dials_before + 3).await);
    tokio::time::sleep(interval * 4).await;
    let attempts = broker.dial_attempts()[dials_before..].to_vec();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[0] - lost_at >= interval);
    for pair in attempts.windows(2) {
        assert!(pair[1] - pair[0] >= interval, "{pair:?}");
    }
}

#[tokio::test]
async fn auto_reconnection_resubscribes_on_a_fresh_connection() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let queue = random_name();
    let consumer = get_consumer(&pool, exchange.clone(), &queue, "k");
    consumer.register_auto_reconnection(Duration::from_millis(20), Retries::Forever);
    let (handler, mut bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    let lost = consumer.connection_id().unwrap();

    // Act
    broker.disconnect_all("CONNECTION_FORCED");
    handle.await.unwrap().unwrap();

    // Assert
    assert!(
        eventually(|| broker.consumer_count(&queue) == 1
            && consumer.connection_id().map_or(false, |id| id != lost))
        .await
    );
    let mut producer = Producer::new(pool.clone(), exchange, BindingOptions::new("k"));
    producer.publish("after restart").await.unwrap();
    assert_eq!(next_body(&mut bodies).await, b"after restart");

    consumer.shutdown().await.unwrap();
    assert!(eventually(|| broker.consumer_count(&queue) == 0).await);
}

#[tokio::test]
async fn a_second_subscription_under_the_same_key_is_rejected() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let queue = random_name();
    let first = get_consumer(&pool, exchange.clone(), &queue, "k");
    let second = get_consumer(&pool, exchange, &queue, "k");
    let (handler, _bodies) = forwarding_handler();
    let running = first.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    let (handler, _other) = forwarding_handler();
    let outcome = second.consume(handler).await;

    // Assert
    assert!(matches!(outcome, Err(Error::DuplicateKey(_))));
    let stats = pool.connections(Role::Consumer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (0, 1));
    // The producer's idle channel and the first consumer's channel.
    assert_eq!(broker.open_channels(), 2);

    first.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_subscriptions_under_the_same_key_let_only_one_through() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    // Opens the consumer connection both subscriptions will race on.
    let bystander = get_consumer(&pool, exchange.clone(), &random_name(), "other");
    let (handler, _bystander_bodies) = forwarding_handler();
    let running = bystander.clone();
    let bystander_handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.open_channels() == 2).await);
    broker.set_latency(Duration::from_millis(10));
    let queue = random_name();
    let consumers = [
        get_consumer(&pool, exchange.clone(), &queue, "k"),
        get_consumer(&pool, exchange, &queue, "k"),
    ];

    // Act
    let handles: Vec<_> = consumers
        .iter()
        .map(|consumer| {
            let consumer = consumer.clone();
            let (handler, _bodies) = forwarding_handler();
            tokio::spawn(async move { consumer.consume(handler).await })
        })
        .collect();
    assert!(eventually(|| handles.iter().any(|h| h.is_finished())).await);

    // Assert
    let (finished, running): (Vec<_>, Vec<_>) = handles
        .into_iter()
        .zip(consumers.iter())
        .partition(|(handle, _)| handle.is_finished());
    assert_eq!(finished.len(), 1);
    let (rejected, _) = finished.into_iter().next().unwrap();
    assert!(matches!(rejected.await.unwrap(), Err(Error::DuplicateKey(_))));
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    let stats = pool.connections(Role::Consumer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (0, 2));

    let (winner, consumer) = running.into_iter().next().unwrap();
    consumer.shutdown().await.unwrap();
    winner.await.unwrap().unwrap();
    bystander.shutdown().await.unwrap();
    bystander_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn an_inequivalent_queue_declaration_fails_without_leaking_the_channel() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let queue = random_name();
    let durable = Consumer::new(
        pool.clone(),
        exchange.clone(),
        Queue::new(&queue).durable(),
        BindingOptions::new("a"),
        ConsumerOptions::default(),
        "",
    );
    let (handler, _bodies) = forwarding_handler();
    let running = durable.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(eventually(|| broker.consumer_count(&queue) == 1).await);
    durable.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();

    // Act
    let transient = get_consumer(&pool, exchange, &queue, "b");
    let (handler, _bodies) = forwarding_handler();
    let outcome = transient.consume(handler).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Topology { .. })));
    assert!(broker.queue(&queue).unwrap().durable);
    let stats = pool.connections(Role::Consumer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (0, 0));
    assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn prefetch_defaults_to_three_and_can_be_changed() {
    let broker = MemoryBroker::new();
    let pool = builder(&broker).build().await.unwrap();
    let consumer = get_consumer(&pool, direct_exchange(), &random_name(), "k");

    assert_eq!(consumer.prefetch_count(), DEFAULT_PREFETCH_COUNT);
    assert_eq!(DEFAULT_PREFETCH_COUNT, 3);
    consumer.qos(10);
    assert_eq!(consumer.prefetch_count(), 10);
}

#[tokio::test]
async fn an_empty_tag_is_replaced_by_a_stable_random_one() {
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let consumer = get_consumer(&pool, direct_exchange(), &random_name(), "k");

    let tag = consumer.tag();

    assert!(!tag.is_empty());
    assert_eq!(consumer.tag(), tag);
}
