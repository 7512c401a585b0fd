//! End-to-end runs of the bridge against the in-memory brokers

use bridge_core::memory::{MemoryAmazon, MemoryRabbit};
use bridge_core::prelude::*;
use bridge_core::{BindingSpec, ChainSpecEngine, QueueSpec};
use bridge_gateway::{load_bridges, provision_local_amazon, BridgeApp};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BRIDGES: &str = r##"[
  {
    "from": { "rabbit": { "exchange": "orders", "queueName": "orders-to-sns", "routingKey": "order.#" } },
    "to": { "sns": { "name": "order-events" } },
    "transformationSpecs": [ { "operation": "shift", "spec": { "id": "orderId", "customer": { "name": "customer.name" } } } ],
    "whitelistedFields": [ "orderId", "customer", "customer.name" ]
  },
  {
    "from": { "rabbit": { "exchange": "audit", "queueName": "audit-to-sqs", "routingKey": "#" } },
    "to": { "sqs": { "name": "audit-archive" } },
    "whitelistedFields": [ "who" ]
  },
  {
    "from": { "sqs": { "name": "order-replies" } },
    "to": { "rabbit": { "exchange": "replies", "routingKey": "order.reply" } },
    "description": "SNS fan-in back to rabbit"
  }
]"##;

fn settings_for(dir: &TempDir, bridges: &str) -> BridgeSettings {
    let path = dir.path().join("bridges.json");
    std::fs::write(&path, bridges).unwrap();

    let mut settings = BridgeSettings::default();
    settings.bridge.config_location = path.display().to_string();
    settings.poller.wait_time = Duration::from_millis(20);
    settings.poller.fixed_delay = Duration::from_millis(5);
    settings.poller.idempotency_key = Some("enabled".into());
    settings.rabbit.retry.initial_interval = Duration::ZERO;
    settings.rabbit.retry.max_interval = Duration::ZERO;
    settings
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_rabbit_to_sns_and_back_to_rabbit() {
    let dir = TempDir::new().unwrap();
    let settings = settings_for(&dir, BRIDGES);
    let bridges = load_bridges(&settings, Arc::new(ChainSpecEngine)).unwrap();
    assert_eq!(bridges.len(), 3);

    let rabbit = MemoryRabbit::new();
    let amazon = MemoryAmazon::new();
    provision_local_amazon(&amazon, &bridges).await;
    amazon.subscribe("order-events", "order-replies").await;

    let app = BridgeApp::new(&settings, bridges, Arc::new(rabbit.clone()), Arc::new(amazon.clone()));
    app.start().await.unwrap();

    // Observe what the reverse bridge publishes
    rabbit.declare_queue(&QueueSpec::durable("observer")).await.unwrap();
    rabbit
        .declare_binding(&BindingSpec {
            queue: "observer".into(),
            exchange: "replies".into(),
            routing_key: "order.#".into(),
        })
        .await
        .unwrap();

    let order = json!({"id": 42, "customer": {"name": "Ada", "card": "4111"}, "total": 9});
    rabbit
        .send("orders", "order.created", Bytes::from(order.to_string()))
        .await
        .unwrap();

    eventually(|| {
        let amazon = amazon.clone();
        async move { !amazon.topic_messages("order-events").await.is_empty() }
    })
    .await;
    let published: Value = serde_json::from_str(&amazon.topic_messages("order-events").await[0]).unwrap();
    assert_eq!(published, json!({"orderId": 42, "customer": {"name": "Ada"}}));

    let mut observed = Vec::new();
    for _ in 0..200 {
        observed.extend(rabbit.take_ready("observer").await);
        if !observed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(observed.len(), 1);

    let delivered: Value = serde_json::from_slice(&observed[0].body).unwrap();
    assert_eq!(delivered["orderId"], json!(42));
    assert_eq!(delivered["customer"], json!({"name": "Ada"}));
    let key = delivered["idempotencyKey"].as_str().unwrap();
    assert!(key.starts_with("replies/"), "unexpected key {key}");

    eventually(|| {
        let amazon = amazon.clone();
        async move { amazon.queue_bodies("order-replies").await.is_empty() }
    })
    .await;

    app.stop().await.unwrap();
}

#[tokio::test]
async fn test_unscrubbable_payload_lands_in_dead_letter_queue() {
    let dir = TempDir::new().unwrap();
    let settings = settings_for(&dir, BRIDGES);
    let bridges = load_bridges(&settings, Arc::new(ChainSpecEngine)).unwrap();

    let rabbit = MemoryRabbit::new();
    let amazon = MemoryAmazon::new();
    provision_local_amazon(&amazon, &bridges).await;

    let app = BridgeApp::new(&settings, bridges, Arc::new(rabbit.clone()), Arc::new(amazon.clone()));
    app.start().await.unwrap();

    rabbit
        .send("audit", "login", Bytes::from_static(b"[1,2,3]"))
        .await
        .unwrap();
    rabbit
        .send("audit", "login", Bytes::from_static(br#"{"who":"ada","ip":"10.0.0.1"}"#))
        .await
        .unwrap();

    eventually(|| {
        let amazon = amazon.clone();
        async move { !amazon.queue_bodies("audit-archive").await.is_empty() }
    })
    .await;
    assert_eq!(amazon.queue_bodies("audit-archive").await, vec![r#"{"who":"ada"}"#]);

    let dead = rabbit.take_ready("audit-to-sqs-dead-letter").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body_text(), "[1,2,3]");

    app.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_bridge_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let settings = settings_for(
        &dir,
        r#"[{"from": {"rabbit": {"exchange": "a", "queueName": "q", "routingKey": "k"}},
             "to": {"rabbit": {"exchange": "b", "routingKey": "k"}}}]"#,
    );

    let err = load_bridges(&settings, Arc::new(ChainSpecEngine)).unwrap_err();
    assert!(err.is_startup());
    assert_eq!(
        err.to_string(),
        "Configuration error: Forwarding rabbit to rabbit is not supported"
    );
}
