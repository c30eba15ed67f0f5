mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{Harness, QUEUE, acked, eventually, harness, nacked, position, publish};
use courier_broker::{Channel, in_memory::BrokerEvent};
use courier_consumer::{
    AcknowledgeMode, Completer, ConsumerSettings, DispatchError, Downstream, DrainReport, Job,
    ShutdownState,
};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Settles every job two seconds after dispatch.
fn slow_downstream() -> Arc<dyn Downstream> {
    Arc::new(|job: Job| async move {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            job.completion.succeed();
        });
        Ok::<(), DispatchError>(())
    })
}

/// Holds every completer without ever settling it.
fn stuck_downstream(parked: Arc<Mutex<Vec<Completer>>>) -> Arc<dyn Downstream> {
    Arc::new(move |job: Job| {
        let parked = Arc::clone(&parked);
        async move {
            parked.lock().push(job.completion);
            Ok::<(), DispatchError>(())
        }
    })
}

/// Counts every job it receives and settles it right away.
fn counting_downstream(dispatched: Arc<AtomicUsize>) -> Arc<dyn Downstream> {
    Arc::new(move |job: Job| {
        dispatched.fetch_add(1, Ordering::SeqCst);
        async move {
            job.completion.succeed();
            Ok::<(), DispatchError>(())
        }
    })
}

/// Every message not acknowledged before the drain must be back on the queue
/// flagged as redelivered.
async fn assert_unsettled_messages_requeued(h: &Harness, published: usize, dispatched: usize) {
    assert_eq!(acked(&h.broker.events()).len(), dispatched);
    assert_eq!(h.broker.ready_count(QUEUE), published - dispatched);

    let connection = h.broker.connect_in_memory();
    let channel = connection.open_in_memory_channel().unwrap();
    let mut subscription = channel.consume(QUEUE).await.unwrap();
    let mut redelivered = 0;
    while let Ok(delivery) = subscription.deliveries.try_recv() {
        assert!(delivery.redelivered, "delivery {:?} was not redelivered", delivery.payload);
        redelivered += 1;
    }
    assert_eq!(redelivered, published - dispatched);
}

#[tokio::test]
async fn stopping_with_buffered_deliveries_leaves_them_for_redelivery() {
    let h = harness(ConsumerSettings::default()).await;
    for index in 0..20 {
        publish(&h.broker, &format!("order-{index}"));
    }
    let dispatched = Arc::new(AtomicUsize::new(0));
    let tag = h
        .consumer
        .start_consumer(
            QUEUE,
            AcknowledgeMode::FailureAware,
            counting_downstream(Arc::clone(&dispatched)),
        )
        .await
        .unwrap();

    // Stop before the delivery loop gets a chance to pull anything.
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    assert!(matches!(report, DrainReport::Drained { .. }));
    let at_close = dispatched.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatched.load(Ordering::SeqCst), at_close);
    assert!(h.broker.ready_count(QUEUE) > 0);
    assert_unsettled_messages_requeued(&h, 20, at_close).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_job_reaches_downstream_after_stop_returns() {
    let settings = ConsumerSettings {
        drain_poll_interval_ms: 1,
        drain_max_polls: 5_000,
        ..ConsumerSettings::default()
    };
    for _ in 0..50 {
        let h = harness(settings.clone()).await;
        for index in 0..20 {
            publish(&h.broker, &format!("order-{index}"));
        }
        let dispatched = Arc::new(AtomicUsize::new(0));
        let tag = h
            .consumer
            .start_consumer(
                QUEUE,
                AcknowledgeMode::FailureAware,
                counting_downstream(Arc::clone(&dispatched)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_micros(50)).await;
        let report = h.consumer.stop_consumer(&tag).await.unwrap();
        assert!(matches!(report, DrainReport::Drained { .. }));
        let at_close = dispatched.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), at_close);
        assert!(h.consumer.tracker().is_idle());
        assert_unsettled_messages_requeued(&h, 20, at_close).await;
    }
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_outstanding_deliveries_before_closing() {
    let h = harness(ConsumerSettings::default()).await;
    let tag = h
        .consumer
        .start_consumer(QUEUE, AcknowledgeMode::FailureAware, slow_downstream())
        .await
        .unwrap();

    for index in 0..3 {
        publish(&h.broker, &format!("order-{index}"));
    }
    eventually(|| h.consumer.tracker().outstanding_count() == 3).await;

    let started = Instant::now();
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    let elapsed = started.elapsed();

    match report {
        DrainReport::Drained { polls } => assert!((1..=3).contains(&polls), "polls = {polls}"),
        other => panic!("unexpected report: {other:?}"),
    }
    assert!(elapsed <= Duration::from_secs(300));
    assert!(elapsed < Duration::from_secs(4));
    assert_eq!(h.consumer.shutdown_state(), ShutdownState::Closed);

    let events = h.broker.events();
    let mut acks = acked(&events);
    acks.sort_unstable();
    assert_eq!(acks, vec![1, 2, 3]);

    let cancel = position(&events, |event| matches!(event, BrokerEvent::Cancel { .. }));
    let channel_closed = position(&events, |event| {
        matches!(event, BrokerEvent::ChannelClosed { .. })
    });
    let connection_closed = position(&events, |event| {
        matches!(event, BrokerEvent::ConnectionClosed { .. })
    });
    let last_ack = events
        .iter()
        .rposition(|event| matches!(event, BrokerEvent::Ack { .. }))
        .unwrap();
    assert!(cancel < last_ack);
    assert!(last_ack < channel_closed);
    assert!(channel_closed < connection_closed);
    assert_eq!(h.broker.ready_count(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn drain_forces_close_after_the_ceiling() {
    let h = harness(ConsumerSettings::default()).await;
    let parked = Arc::new(Mutex::new(Vec::new()));
    let tag = h
        .consumer
        .start_consumer(
            QUEUE,
            AcknowledgeMode::AfterSuccess,
            stuck_downstream(Arc::clone(&parked)),
        )
        .await
        .unwrap();

    publish(&h.broker, "never finishes");
    eventually(|| h.consumer.tracker().outstanding_count() == 1).await;

    let started = Instant::now();
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report, DrainReport::TimedOut { abandoned: vec![1] });
    assert!(elapsed >= Duration::from_secs(300));
    assert!(elapsed < Duration::from_secs(301));
    assert!(h.consumer.tracker().is_idle());
    assert!(!h.channel.is_open());
    assert_eq!(h.broker.ready_count(QUEUE), 1);

    // Settling late must not reach the broker.
    if let Some(completer) = parked.lock().pop() {
        completer.succeed();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    let events = h.broker.events();
    assert!(acked(&events).is_empty());
    assert!(nacked(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn drain_is_idempotent() {
    let h = harness(ConsumerSettings::default()).await;
    let tag = h
        .consumer
        .start_consumer(QUEUE, AcknowledgeMode::FailureAware, slow_downstream())
        .await
        .unwrap();
    publish(&h.broker, "in flight");
    eventually(|| h.consumer.tracker().outstanding_count() == 1).await;

    let (first, second) = tokio::join!(
        h.consumer.stop_consumer(&tag),
        h.consumer.stop_consumer(&tag)
    );
    let mut reports = vec![first.unwrap(), second.unwrap()];
    reports.sort_by_key(|report| matches!(report, DrainReport::AlreadyRequested));
    assert!(matches!(reports[0], DrainReport::Drained { .. }));
    assert_eq!(reports[1], DrainReport::AlreadyRequested);

    assert_eq!(
        h.consumer.stop_consumer(&tag).await.unwrap(),
        DrainReport::AlreadyRequested
    );
    let cancels = h
        .broker
        .events()
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Cancel { .. }))
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_consumer_closes_without_waiting() {
    let h = harness(ConsumerSettings::default()).await;
    let tag = h
        .consumer
        .start_consumer(QUEUE, AcknowledgeMode::AfterSuccess, slow_downstream())
        .await
        .unwrap();

    let started = Instant::now();
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    assert_eq!(report, DrainReport::Drained { polls: 0 });
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(!h.broker.is_connection_open(h.connection.id()));

    // The subscription is gone, so new messages stay on the queue.
    publish(&h.broker, "after shutdown");
    assert_eq!(h.broker.ready_count(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn drain_honors_configured_interval_and_ceiling() {
    let settings = ConsumerSettings {
        drain_poll_interval_ms: 10,
        drain_max_polls: 5,
        ..ConsumerSettings::default()
    };
    let h = harness(settings).await;
    let parked = Arc::new(Mutex::new(Vec::new()));
    let tag = h
        .consumer
        .start_consumer(
            QUEUE,
            AcknowledgeMode::FailureAware,
            stuck_downstream(Arc::clone(&parked)),
        )
        .await
        .unwrap();
    publish(&h.broker, "a");
    publish(&h.broker, "b");
    eventually(|| h.consumer.tracker().outstanding_count() == 2).await;

    let started = Instant::now();
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_millis(50));
    match report {
        DrainReport::TimedOut { mut abandoned } => {
            abandoned.sort_unstable();
            assert_eq!(abandoned, vec![1, 2]);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    assert_eq!(h.broker.ready_count(QUEUE), 2);
}

#[tokio::test(start_paused = true)]
async fn drain_after_channel_fault_still_closes_the_connection() {
    let h = harness(ConsumerSettings::default()).await;
    let tag = h
        .consumer
        .start_consumer(QUEUE, AcknowledgeMode::FailureAware, slow_downstream())
        .await
        .unwrap();
    publish(&h.broker, "interrupted");
    eventually(|| h.consumer.tracker().outstanding_count() == 1).await;

    h.channel.inject_fault(541, "internal error");
    let _ = h.consumer.wait_for_fault().await;

    // The pending ack fails on the closed channel and the tag is released.
    let report = h.consumer.stop_consumer(&tag).await.unwrap();
    assert!(matches!(report, DrainReport::Drained { .. }));
    assert!(h.consumer.tracker().is_idle());
    assert!(acked(&h.broker.events()).is_empty());
    assert!(!h.broker.is_connection_open(h.connection.id()));
    assert_eq!(h.broker.ready_count(QUEUE), 1);
}
