//! End-to-end scenarios against a `Coordinator` wired to the fakes in
//! `testkit`, covering the behaviors a real broker would need to exercise:
//! registration failures, shutdown-driven and metadata-driven recovery,
//! recovery timeout, and slot packing/reclamation.

use std::sync::Arc;
use std::time::Duration;

use stream_producers_coordinator::testkit::{
    deleted, ok_with_leader, ok_without_leader, FakeClientFactory, FakeLocator, HookEvent,
    RecordingHooks,
};
use stream_producers_coordinator::{BackoffPolicy, BrokerKey, Config, Coordinator};

fn leader1() -> BrokerKey {
    BrokerKey::new("broker-1", 5552)
}

fn leader2() -> BrokerKey {
    BrokerKey::new("broker-2", 5552)
}

async fn settle() {
    tokio::time::delay_for(Duration::from_millis(20)).await;
}

// S1 - pure registration failures.
#[tokio::test]
async fn s1_registration_failures() {
    let locator = Arc::new(FakeLocator::new());
    let factory = Arc::new(FakeClientFactory::new());
    let coordinator = Coordinator::new(Config::builder().build(), locator.clone(), factory);

    // Stream entirely absent from the locator's response.
    let hooks = RecordingHooks::new();
    let err = coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("does not exist"));

    // Explicit STREAM_DOES_NOT_EXIST.
    locator.set("s", Ok(deleted("s")));
    let err = coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("does not exist"));

    // ACCESS_REFUSED is an illegal state for a fresh registration.
    locator.set(
        "s",
        Ok(Some(stream_producers_coordinator::StreamMetadata::new(
            "s",
            stream_producers_coordinator::ResponseCode::AccessRefused,
            None,
            vec![],
        ))),
    );
    let err = coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("illegal state"));

    // OK with no leader yet.
    locator.set("s", Ok(ok_without_leader("s")));
    let err = coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("illegal state"));

    // OK with a leader succeeds.
    locator.set("s", Ok(ok_with_leader("s", leader1())));
    coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap();
    assert_eq!(hooks.set_client_count(), 1);
}

// S2 - shutdown-driven redistribution.
#[tokio::test]
async fn s2_shutdown_redistribution() {
    let locator = Arc::new(FakeLocator::new());
    locator.set("s", Ok(ok_with_leader("s", leader1())));
    let factory = Arc::new(FakeClientFactory::new());
    let config = Config::builder()
        .shutdown_backoff(BackoffPolicy::fixed(Duration::from_millis(5)))
        .build();
    let coordinator = Coordinator::new(config, locator.clone(), factory.clone());

    let producer_hooks = RecordingHooks::new();
    let producer_handle = coordinator
        .register_producer(producer_hooks.clone() as _, "s")
        .await
        .unwrap();
    let consumer_hooks = RecordingHooks::new();
    let _consumer_handle = coordinator
        .register_committing_consumer(consumer_hooks.clone() as _, "s")
        .await
        .unwrap();

    let connection = factory.connections().into_iter().next().unwrap();

    // Until the reconnect, metadata flaps with no leader twice.
    locator.queue("s", Ok(ok_without_leader("s")));
    locator.queue("s", Ok(ok_without_leader("s")));
    locator.queue("s", Ok(ok_with_leader("s", leader1())));

    connection.events.shutdown();
    settle().await;
    tokio::time::delay_for(Duration::from_millis(40)).await;

    assert_eq!(producer_hooks.unavailable_count(), 1);
    assert_eq!(producer_hooks.set_client_count(), 2);
    assert!(producer_hooks.events().contains(&HookEvent::Running));

    assert_eq!(consumer_hooks.unavailable_count(), 1);
    assert_eq!(consumer_hooks.set_client_count(), 2);

    assert_eq!(coordinator.pool_size().await, 1);
    assert_eq!(coordinator.client_count().await, 1);

    producer_handle.release().await;
}

// S3 - shutdown recovery timeout.
#[tokio::test]
async fn s3_shutdown_recovery_timeout() {
    let locator = Arc::new(FakeLocator::new());
    locator.set("s", Ok(ok_with_leader("s", leader1())));
    let factory = Arc::new(FakeClientFactory::new());
    let config = Config::builder()
        .shutdown_backoff(
            BackoffPolicy::fixed_with_initial_delay_and_timeout(
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(100),
            )
            .unwrap(),
        )
        .build();
    let coordinator = Coordinator::new(config, locator.clone(), factory.clone());

    let producer_hooks = RecordingHooks::new();
    coordinator
        .register_producer(producer_hooks.clone() as _, "s")
        .await
        .unwrap();
    let consumer_hooks = RecordingHooks::new();
    coordinator
        .register_committing_consumer(consumer_hooks.clone() as _, "s")
        .await
        .unwrap();

    // Locator never finds a leader again.
    locator.set("s", Ok(ok_without_leader("s")));

    let connection = factory.connections().into_iter().next().unwrap();
    connection.events.shutdown();

    tokio::time::delay_for(Duration::from_millis(200)).await;

    assert_eq!(producer_hooks.unavailable_count(), 1);
    assert!(producer_hooks.was_closed());
    assert!(!producer_hooks.events().contains(&HookEvent::Running));

    assert_eq!(consumer_hooks.unavailable_count(), 1);
    assert!(!consumer_hooks.was_closed());

    assert_eq!(coordinator.pool_size().await, 0);
    assert_eq!(coordinator.client_count().await, 0);
}

// S4 - metadata update moves one stream, leaves another alone.
#[tokio::test]
async fn s4_metadata_moves_a_stream() {
    let locator = Arc::new(FakeLocator::new());
    locator.set("moving-stream", Ok(ok_with_leader("moving-stream", leader1())));
    locator.set("fixed-stream", Ok(ok_with_leader("fixed-stream", leader1())));
    let factory = Arc::new(FakeClientFactory::new());
    let config = Config::builder()
        .topology_backoff(BackoffPolicy::fixed(Duration::from_millis(5)))
        .build();
    let coordinator = Coordinator::new(config, locator.clone(), factory.clone());

    let moving_producer = RecordingHooks::new();
    coordinator
        .register_producer(moving_producer.clone() as _, "moving-stream")
        .await
        .unwrap();
    let moving_consumer = RecordingHooks::new();
    coordinator
        .register_committing_consumer(moving_consumer.clone() as _, "moving-stream")
        .await
        .unwrap();

    let fixed_producer = RecordingHooks::new();
    coordinator
        .register_producer(fixed_producer.clone() as _, "fixed-stream")
        .await
        .unwrap();
    let fixed_consumer = RecordingHooks::new();
    coordinator
        .register_committing_consumer(fixed_consumer.clone() as _, "fixed-stream")
        .await
        .unwrap();

    let first_connection = factory.connections().into_iter().next().unwrap();

    locator.queue("moving-stream", Ok(ok_without_leader("moving-stream")));
    locator.queue("moving-stream", Ok(ok_with_leader("moving-stream", leader2())));

    first_connection.events.metadata_changed("moving-stream");
    tokio::time::delay_for(Duration::from_millis(40)).await;

    assert_eq!(moving_producer.unavailable_count(), 1);
    assert_eq!(moving_producer.set_client_count(), 2);
    assert_eq!(moving_consumer.unavailable_count(), 1);
    assert_eq!(moving_consumer.set_client_count(), 2);

    assert_eq!(fixed_producer.unavailable_count(), 0);
    assert_eq!(fixed_producer.set_client_count(), 1);
    assert_eq!(fixed_consumer.unavailable_count(), 0);

    assert_eq!(coordinator.pool_size().await, 2);
    assert_eq!(coordinator.client_count().await, 2);
}

// S5 - stream deleted via metadata event.
#[tokio::test]
async fn s5_stream_deleted_via_metadata_event() {
    let locator = Arc::new(FakeLocator::new());
    locator.set("s", Ok(ok_with_leader("s", leader1())));
    let factory = Arc::new(FakeClientFactory::new());
    let config = Config::builder()
        .topology_backoff(BackoffPolicy::fixed(Duration::from_millis(5)))
        .build();
    let coordinator = Coordinator::new(config, locator.clone(), factory.clone());

    let hooks = RecordingHooks::new();
    coordinator
        .register_producer(hooks.clone() as _, "s")
        .await
        .unwrap();

    let connection = factory.connections().into_iter().next().unwrap();
    locator.set("s", Ok(deleted("s")));
    connection.events.metadata_changed("s");

    tokio::time::delay_for(Duration::from_millis(40)).await;

    assert_eq!(hooks.unavailable_count(), 1);
    assert!(hooks.was_closed());
    assert_eq!(coordinator.pool_size().await, 0);
}

// S6 - slot packing and reclamation.
#[tokio::test]
async fn s6_slot_packing_and_reclamation() {
    let locator = Arc::new(FakeLocator::new());
    locator.set("s", Ok(ok_with_leader("s", leader1())));
    let factory = Arc::new(FakeClientFactory::new());
    const MAX_PRODUCERS: usize = 16;
    const MAX_CONSUMERS: usize = 2;
    let config = Config::builder()
        .max_producers_per_client(MAX_PRODUCERS)
        .max_committing_consumers_per_client(MAX_CONSUMERS)
        .build();
    let coordinator = Coordinator::new(config, locator, factory);

    let k = 3;
    let mut producer_handles = Vec::new();
    for _ in 0..(MAX_PRODUCERS + k) {
        let hooks = RecordingHooks::new();
        producer_handles.push(
            coordinator
                .register_producer(hooks as _, "s")
                .await
                .unwrap(),
        );
    }
    assert_eq!(coordinator.client_count().await, 2);

    let mut consumer_handles = Vec::new();
    loop {
        let hooks = RecordingHooks::new();
        consumer_handles.push(
            coordinator
                .register_committing_consumer(hooks as _, "s")
                .await
                .unwrap(),
        );
        if coordinator.client_count().await == 3 {
            break;
        }
    }

    // Release every consumer bound to the third manager to collapse it back down.
    while coordinator.client_count().await == 3 {
        let handle = consumer_handles.pop().expect("consumers remain to release");
        handle.release().await;
    }
    assert_eq!(coordinator.client_count().await, 2);

    // Release the producer bound to slot 10 of manager 0 and re-register: the
    // new producer must be handed the same publishing id back (lowest free
    // slot wins).
    let reused_slot_handle = producer_handles.remove(10);
    reused_slot_handle.release().await;

    let reused_hooks = RecordingHooks::new();
    let reused_handle = coordinator
        .register_producer(reused_hooks.clone() as _, "s")
        .await
        .unwrap();
    assert_eq!(
        reused_hooks.events().first(),
        Some(&HookEvent::SetPublisherId(10))
    );
    producer_handles.push(reused_handle);

    for handle in producer_handles {
        handle.release().await;
    }
    for handle in consumer_handles {
        handle.release().await;
    }
    assert_eq!(coordinator.client_count().await, 1);
}
