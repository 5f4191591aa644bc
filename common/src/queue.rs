//! Keyed at-least-once work queue. Two logical topics are in play:
//! `ingestion` carries normalized documents keyed by `tenant:source_id`,
//! `ingestion_dlq` carries records that exhausted their retries. Duplicate
//! keys may be delivered; consumers deduplicate by checksum.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::RagError;

pub const TOPIC_INGESTION: &str = "ingestion";
pub const TOPIC_INGESTION_DLQ: &str = "ingestion_dlq";

const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub key: String,
    pub value: Value,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn produce(&self, topic: &str, key: &str, value: Value) -> Result<(), RagError>;

    /// Attach a consumer. Messages produced before the first subscriber are
    /// buffered and replayed.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<QueueMessage>, RagError>;

    /// Messages buffered without a live consumer, per topic.
    async fn backlog(&self, topic: &str) -> usize;

    async fn healthy(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct TopicState {
    backlog: VecDeque<QueueMessage>,
    subscribers: Vec<mpsc::Sender<QueueMessage>>,
}

/// In-process queue over bounded channels; the reference implementation the
/// tests and the demo binary run on.
#[derive(Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn produce(&self, topic: &str, key: &str, value: Value) -> Result<(), RagError> {
        let message = QueueMessage {
            key: key.to_owned(),
            value,
            ts: Utc::now(),
        };

        let senders: Vec<mpsc::Sender<QueueMessage>> = {
            let mut topics = self.topics.lock().await;
            let state = topics.entry(topic.to_owned()).or_default();
            state.subscribers.retain(|s| !s.is_closed());
            if state.subscribers.is_empty() {
                state.backlog.push_back(message);
                return Ok(());
            }
            state.subscribers.clone()
        };

        for sender in senders {
            // A closed receiver is not an error; it is pruned on the next
            // produce.
            let _ = sender.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<QueueMessage>, RagError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let backlog = {
            let mut topics = self.topics.lock().await;
            let state = topics.entry(topic.to_owned()).or_default();
            state.subscribers.push(tx.clone());
            std::mem::take(&mut state.backlog)
        };
        for message in backlog {
            let _ = tx.send(message).await;
        }
        Ok(rx)
    }

    async fn backlog(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |state| state.backlog.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn produce_then_subscribe_replays_backlog() {
        let queue = MemoryQueue::new();
        queue
            .produce(TOPIC_INGESTION, "acme:1", json!({"n": 1}))
            .await
            .unwrap();
        queue
            .produce(TOPIC_INGESTION, "acme:2", json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(queue.backlog(TOPIC_INGESTION).await, 2);

        let mut rx = queue.subscribe(TOPIC_INGESTION).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.key, "acme:1");
        assert_eq!(second.key, "acme:2");
        assert_eq!(queue.backlog(TOPIC_INGESTION).await, 0);
    }

    #[tokio::test]
    async fn live_subscriber_receives_messages() {
        let queue = MemoryQueue::new();
        let mut rx = queue.subscribe(TOPIC_INGESTION).await.unwrap();
        queue
            .produce(TOPIC_INGESTION, "acme:1", json!({"n": 1}))
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key, "acme:1");
        assert_eq!(msg.value["n"], 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let queue = MemoryQueue::new();
        let mut dlq = queue.subscribe(TOPIC_INGESTION_DLQ).await.unwrap();
        queue
            .produce(TOPIC_INGESTION, "acme:1", json!({"n": 1}))
            .await
            .unwrap();
        queue
            .produce(TOPIC_INGESTION_DLQ, "acme:tool", json!({"error": "x"}))
            .await
            .unwrap();

        let msg = dlq.recv().await.unwrap();
        assert_eq!(msg.key, "acme:tool");
        assert_eq!(queue.backlog(TOPIC_INGESTION).await, 1);
    }
}
