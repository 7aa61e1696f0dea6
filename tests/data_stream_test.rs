//! End-to-end tests for the data server over real TCP connections.

use lablink::client::DataClient;
use lablink::config::Settings;
use lablink::data::server::DataServer;
use lablink::error::LabError;
use lablink::proto::Record;
use serde_json::json;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn data_settings() -> Settings {
    let mut settings = Settings::default();
    settings.data_server.listen_addr = "127.0.0.1:0".to_string();
    settings
}

async fn collect(rx: &mut tokio::sync::mpsc::Receiver<Record>, n: usize) -> Vec<Record> {
    let mut records = Vec::with_capacity(n);
    for _ in 0..n {
        let record = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("record delivery timed out")
            .expect("subscription closed early");
        records.push(record);
    }
    records
}

#[tokio::test]
async fn test_early_and_late_subscribers_see_ordered_suffixes() {
    let settings = data_settings();
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();

    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut early = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut late = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();

    let mut early_rx = early.subscribe("scan", false).await.unwrap();
    for i in 0..50 {
        publisher.publish("scan", json!({ "i": i })).await.unwrap();
    }

    let mut late_rx = late.subscribe("scan", false).await.unwrap();
    for i in 50..100 {
        publisher.publish("scan", json!({ "i": i })).await.unwrap();
    }

    let early_records = collect(&mut early_rx, 100).await;
    let seqs: Vec<u64> = early_records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..100).collect::<Vec<u64>>());

    // The late subscriber sees only records published after it attached,
    // still in publish order with no gaps.
    let late_records = collect(&mut late_rx, 50).await;
    let seqs: Vec<u64> = late_records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (50..100).collect::<Vec<u64>>());

    server.stop().await;
}

#[tokio::test]
async fn test_publish_acks_carry_sequence_numbers() {
    let settings = data_settings();
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();
    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();

    for expected in 0..5u64 {
        let seq = publisher
            .publish("counts", json!({ "value": expected }))
            .await
            .unwrap();
        assert_eq!(seq, expected);
    }
    server.stop().await;
}

#[tokio::test]
async fn test_static_mode_rejects_unknown_streams() {
    let mut settings = data_settings();
    settings.data_server.predeclared_streams = vec!["wavemeter".to_string()];
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();
    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();

    publisher
        .publish("wavemeter", json!({ "nm": 637.2 }))
        .await
        .unwrap();
    let err = publisher
        .publish("mystery", json!({ "nm": 0.0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::UnknownStream(_)), "{err:?}");

    server.stop().await;
}

#[tokio::test]
async fn test_backlog_replay_on_request() {
    let mut settings = data_settings();
    settings.data_server.backlog_capacity = 16;
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();

    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    for i in 0..10 {
        publisher.publish("scan", json!({ "i": i })).await.unwrap();
    }

    let mut replayer = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut rx = replayer.subscribe("scan", true).await.unwrap();
    let replayed = collect(&mut rx, 10).await;
    let seqs: Vec<u64> = replayed.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<u64>>());

    server.stop().await;
}

#[tokio::test]
async fn test_resubscribe_replaces_prior_delivery() {
    let settings = data_settings();
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();

    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut subscriber = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();

    let first_rx = subscriber.subscribe("scan", false).await.unwrap();
    drop(first_rx);
    let mut rx = subscriber.subscribe("scan", false).await.unwrap();

    publisher.publish("scan", json!({ "i": 0 })).await.unwrap();
    let delivered = collect(&mut rx, 1).await.remove(0);
    assert_eq!(delivered.seq, 0);

    // Exactly one copy: the stale subscription's forwarder is gone.
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "record delivered twice: {extra:?}");

    server.stop().await;
}

#[tokio::test]
async fn test_producer_timestamps_survive_the_wire() {
    let settings = data_settings();
    let server = DataServer::start(&settings).await.unwrap();
    let endpoint = server.local_addr().to_string();

    let mut publisher = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut subscriber = DataClient::connect(&endpoint, TIMEOUT).await.unwrap();
    let mut rx = subscriber.subscribe("raw", false).await.unwrap();

    let mut record = Record::new("raw", json!({ "adc": [1, 2, 3] }));
    record.timestamp_us = 1_725_000_000_000_000;
    publisher.publish_record(record).await.unwrap();

    let delivered = collect(&mut rx, 1).await.remove(0);
    assert_eq!(delivered.timestamp_us, 1_725_000_000_000_000);
    assert_eq!(delivered.payload, json!({ "adc": [1, 2, 3] }));

    server.stop().await;
}
