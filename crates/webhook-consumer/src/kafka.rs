//! Broker driver seam (spec.md §4.8, §9: "single-owner Consumer Manager
//! with explicit start/stop and a small driver interface per broker
//! kind"). `KafkaDriver` is the only implementation; grounded on the
//! teacher's `webhook-consumer/src/main.rs` `StreamConsumer` setup,
//! switched from auto-commit to manual, per-message commit.

use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use webhook_core::error::ConsumerError;
use webhook_core::model::Subscription;

/// One received message, already detached from the broker's own borrowed
/// buffers so the router can hold it across an `.await`.
pub struct BrokerMessage {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Per-subscription broker handle. One instance is created per
/// registered `Subscription`; `recv` is called in a loop by the
/// consumer task until cancellation, and `commit` is called exactly
/// once per received message after the router returns.
#[async_trait]
pub trait BrokerDriver: Send {
    async fn recv(&mut self) -> Result<BrokerMessage, ConsumerError>;
    fn commit(&mut self) -> Result<(), ConsumerError>;
}

pub struct KafkaDriver {
    consumer: StreamConsumer,
    pending: Option<(String, i32, i64)>,
}

impl KafkaDriver {
    pub fn connect(sub: &Subscription, default_brokers: &str) -> Result<Self, ConsumerError> {
        let brokers = sub.connection_config.get("bootstrap.servers").cloned().unwrap_or_else(|| default_brokers.to_string());
        let group_id = sub.consumer_group_id.clone().unwrap_or_else(|| format!("webhook-consumer-{}", sub.id));

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        for (key, value) in &sub.connection_config {
            if key != "bootstrap.servers" {
                client_config.set(key, value);
            }
        }

        let consumer: StreamConsumer =
            client_config.create().map_err(|e| ConsumerError::Broker(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[sub.topic_or_queue.as_str()])
            .map_err(|e| ConsumerError::Broker(format!("failed to subscribe to {}: {e}", sub.topic_or_queue)))?;

        Ok(Self { consumer, pending: None })
    }
}

#[async_trait]
impl BrokerDriver for KafkaDriver {
    async fn recv(&mut self) -> Result<BrokerMessage, ConsumerError> {
        let message = self.consumer.recv().await.map_err(|e| ConsumerError::Broker(e.to_string()))?;
        let payload = message.payload().unwrap_or_default().to_vec();
        let mut headers = HashMap::new();
        if let Some(kafka_headers) = message.headers() {
            for i in 0..kafka_headers.count() {
                let header = kafka_headers.get(i);
                if let Ok(value) = std::str::from_utf8(header.value.unwrap_or_default()) {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        self.pending = Some((message.topic().to_string(), message.partition(), message.offset()));
        Ok(BrokerMessage { payload, headers })
    }

    fn commit(&mut self) -> Result<(), ConsumerError> {
        let Some((topic, partition, offset)) = self.pending.take() else {
            return Ok(());
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&topic, partition, rdkafka::Offset::Offset(offset + 1))
            .map_err(|e| ConsumerError::Broker(format!("failed to build offset list: {e}")))?;
        self.consumer.commit(&tpl, CommitMode::Async).map_err(|e| ConsumerError::Broker(format!("commit failed: {e}")))
    }
}
