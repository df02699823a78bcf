//! End-to-end commit semantics over the in-memory broker and coordinator

use bridge_config::CommitterConfig;
use kafka_bridge::{
    BridgeConfig, CoordinatedCommitter, Envelope, InMemoryBroker, InMemoryCoordinator,
    KafkaCommitter, OffsetCommitter, PublisherWithCommitSink, Signal, Subscription,
    TopicPartition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn bridge_config(topic: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.consumer.group_id = "g".to_string();
    config.consumer.topics = vec![topic.to_string()];
    config.consumer.fetch_timeout = Duration::from_millis(20);
    config.committer = CommitterConfig {
        connect_timeout: Duration::from_millis(500),
        lock_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    config
}

fn broker_with_records(topic: &str, partitions: usize, per_partition: usize) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_topic(topic, partitions);
    for partition in 0..partitions {
        for i in 0..per_partition {
            broker
                .append(topic, partition as i32, None, Some(vec![i as u8]))
                .unwrap();
        }
    }
    broker
}

async fn next(records: &mut mpsc::Receiver<Signal<Envelope>>) -> Envelope {
    match tokio::time::timeout(Duration::from_secs(2), records.recv()).await {
        Ok(Some(Signal::Next(envelope))) => envelope,
        Ok(Some(Signal::Error(e))) => panic!("source failed: {}", e),
        _ => panic!("expected a record"),
    }
}

/// Read offsets 0..=5, acknowledge 0..=2, restart: resume at 3
async fn run_ack_three_of_six(
    broker: &InMemoryBroker,
    committer: Arc<dyn OffsetCommitter>,
) -> Vec<i64> {
    let config = bridge_config("t");
    let consumer = Arc::new(broker.consumer("g"));
    let (pair, mut records) = PublisherWithCommitSink::start(consumer, committer, &config)
        .await
        .unwrap();

    pair.subscription().request(6);
    let mut offsets = Vec::new();
    for _ in 0..6 {
        let envelope = next(&mut records).await;
        offsets.push(envelope.offset);
        if envelope.offset <= 2 {
            pair.commit_sink().ack(&envelope).unwrap();
        }
    }

    pair.shutdown().await.unwrap();
    offsets
}

#[tokio::test]
async fn test_restart_resumes_after_last_ack_broker_native() {
    let broker = broker_with_records("t", 1, 6);
    let committer = Arc::new(KafkaCommitter::new(
        Arc::new(broker.consumer("g")),
        Duration::from_secs(1),
    ));

    let offsets = run_ack_three_of_six(&broker, committer).await;
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);

    let fresh = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));
    fresh.start().await.unwrap();
    let stored = fresh.fetch(&[TopicPartition::new("t", 0)]).await.unwrap();
    assert_eq!(stored.get(&TopicPartition::new("t", 0)), Some(3));

    // At-least-once: a restarted consumer sees 3, 4 and 5 again
    let config = bridge_config("t");
    let consumer = Arc::new(broker.consumer("g"));
    let (pair, mut records) =
        PublisherWithCommitSink::start(consumer, Arc::new(fresh), &config)
            .await
            .unwrap();
    pair.subscription().request(3);
    let redelivered: Vec<i64> = vec![
        next(&mut records).await.offset,
        next(&mut records).await.offset,
        next(&mut records).await.offset,
    ];
    assert_eq!(redelivered, vec![3, 4, 5]);
    pair.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_after_last_ack_coordinated() {
    let broker = broker_with_records("t", 1, 6);
    let coordinator = InMemoryCoordinator::new();
    let config = bridge_config("t");

    let committer = Arc::new(CoordinatedCommitter::new(
        coordinator.session(),
        "g",
        &config.committer,
    ));
    run_ack_three_of_six(&broker, committer).await;

    let fresh = CoordinatedCommitter::new(coordinator.session(), "g", &config.committer);
    fresh.start().await.unwrap();
    let stored = fresh.fetch(&[TopicPartition::new("t", 0)]).await.unwrap();
    assert_eq!(stored.get(&TopicPartition::new("t", 0)), Some(3));
    fresh.stop().await.unwrap();

    assert_eq!(coordinator.open_sessions(), 0);
}

#[tokio::test]
async fn test_demand_discipline() {
    let broker = broker_with_records("t", 2, 20);
    let config = bridge_config("t");
    let consumer = Arc::new(broker.consumer("g"));
    let committer = Arc::new(KafkaCommitter::new(consumer.clone(), Duration::from_secs(1)));
    let (pair, mut records) = PublisherWithCommitSink::start(consumer, committer, &config)
        .await
        .unwrap();

    let mut requested = 0u64;
    let mut last_offset = [-1i64; 2];
    for batch in [1u64, 4, 7, 3] {
        pair.subscription().request(batch);
        requested += batch;

        for _ in 0..batch {
            let envelope = next(&mut records).await;
            let last = &mut last_offset[envelope.partition as usize];
            assert!(envelope.offset > *last, "offsets must increase per partition");
            *last = envelope.offset;
        }

        // Nothing beyond the requested amount arrives
        assert!(tokio::time::timeout(Duration::from_millis(50), records.recv())
            .await
            .is_err());

        let metrics = pair.subscription().metrics().await;
        assert_eq!(metrics.requested, requested);
        assert!(metrics.emitted <= metrics.requested);
    }

    pair.shutdown().await.unwrap();
}
