//! Source-to-sink pipelines and producer failure escalation

use bridge_config::SourceConfig;
use kafka_bridge::broker::InMemoryProducer;
use kafka_bridge::stream::SinkTermination;
use kafka_bridge::{
    supervise, BridgeError, BrokerConsumer, BrokerProducer, DemandSink, DemandSource, Envelope,
    InMemoryBroker, ProducerRecord, RestartPolicy, Signal, WatermarkRequestStrategy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn forward(
    mut records: mpsc::Receiver<Signal<Envelope>>,
    topic: &'static str,
) -> mpsc::Receiver<Signal<ProducerRecord>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(signal) = records.recv().await {
            let mapped = match signal {
                Signal::Next(envelope) => {
                    Signal::Next(ProducerRecord::new(topic).with_value(envelope.value.unwrap_or_default()))
                }
                Signal::Error(e) => Signal::Error(e),
                Signal::Complete => Signal::Complete,
            };
            if tx.send(mapped).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::test]
async fn test_copy_topic_then_cancel() {
    let broker = InMemoryBroker::new();
    broker.create_topic("in", 1);
    broker.create_topic("out", 1);
    for i in 0..5u8 {
        broker.append("in", 0, None, Some(vec![i])).unwrap();
    }

    let consumer = Arc::new(broker.consumer("copier"));
    let producer = broker.producer();
    let (source, records) = DemandSource::new(
        consumer.clone(),
        vec!["in".to_string()],
        SourceConfig::default(),
    )
    .with_fetch_timeout(Duration::from_millis(20))
    .spawn();

    let sink = DemandSink::new(Arc::new(producer.clone()), Arc::new(source.clone()))
        .with_strategy(WatermarkRequestStrategy::new(4, 2).unwrap())
        .spawn(forward(records, "out"));

    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.records("out", 0).len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let copied: Vec<Option<Vec<u8>>> = broker
        .records("out", 0)
        .into_iter()
        .map(|record| record.value)
        .collect();
    assert_eq!(copied, (0..5u8).map(|i| Some(vec![i])).collect::<Vec<_>>());

    sink.cancel();
    assert_eq!(sink.join().await.unwrap(), SinkTermination::Cancelled);

    tokio::time::timeout(Duration::from_secs(2), source.terminated())
        .await
        .unwrap();
    assert!(consumer.is_closed());
    assert_eq!(producer.times_closed(), 1);
}

#[tokio::test]
async fn test_externally_closed_producer_escalates_once() {
    let broker = InMemoryBroker::new();
    broker.create_topic("out", 1);
    let producer: InMemoryProducer = broker.producer();
    let (tx, rx) = mpsc::channel(8);
    let (upstream, _records) = DemandSource::new(
        Arc::new(broker.consumer("g")),
        vec![],
        SourceConfig::default(),
    )
    .spawn();

    producer.close().await.unwrap();
    tx.send(Signal::Next(ProducerRecord::new("out").with_value("x")))
        .await
        .unwrap();

    let mut elements = Some(rx);
    let mut runs = 0;
    let sink_producer = producer.clone();
    let result = supervise("sink", &RestartPolicy::default(), || {
        runs += 1;
        let elements = elements.take();
        let producer = sink_producer.clone();
        let upstream = upstream.clone();
        async move {
            let elements = elements.ok_or(BridgeError::Cancelled)?;
            DemandSink::new(Arc::new(producer), Arc::new(upstream))
                .spawn(elements)
                .join()
                .await
                .map(|_| ())
        }
    })
    .await;

    match result {
        Err(BridgeError::Escalated { child, source }) => {
            assert_eq!(child, "sink");
            assert!(matches!(*source, BridgeError::ProducerClosed { .. }));
        }
        other => panic!("expected escalation, got {:?}", other),
    }
    assert_eq!(runs, 1, "a closed producer is not retried");
    assert_eq!(producer.times_closed(), 1);
    assert!(broker.records("out", 0).is_empty());

    // The sink cancelled its upstream on failure
    tokio::time::timeout(Duration::from_secs(2), upstream.terminated())
        .await
        .unwrap();
}
