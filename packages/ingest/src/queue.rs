// ABOUTME: In-process bounded queue between the webhook and the ingestion workers
// ABOUTME: Workers share one receiver; every delivery is acknowledged exactly once

use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// One delivery of a raw message body
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub delivery_id: String,
    pub body: JsonValue,
}

pub struct IngestQueue {
    sender: mpsc::Sender<QueueMessage>,
    receiver: Mutex<mpsc::Receiver<QueueMessage>>,
    shutdown: watch::Sender<bool>,
    acked: AtomicU64,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sender,
            receiver: Mutex::new(receiver),
            shutdown,
            acked: AtomicU64::new(0),
        })
    }

    pub fn publisher(&self) -> QueuePublisher {
        QueuePublisher {
            sender: self.sender.clone(),
        }
    }

    /// Next message, or `None` once the queue is shut down.
    ///
    /// Only one worker waits on the channel at a time, so each worker holds at most one
    /// unacknowledged message.
    pub async fn recv(&self) -> Option<QueueMessage> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return None;
        }

        let mut receiver = tokio::select! {
            guard = self.receiver.lock() => guard,
            _ = shutdown.changed() => return None,
        };
        tokio::select! {
            message = receiver.recv() => message,
            _ = shutdown.changed() => None,
        }
    }

    pub fn ack(&self, message: &QueueMessage) {
        let total = self.acked.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(delivery_id = %message.delivery_id, acked_total = total, "Message acknowledged");
    }

    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Stop handing out messages; waiting workers return `None`
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Cloneable handle for enqueueing message bodies
#[derive(Clone)]
pub struct QueuePublisher {
    sender: mpsc::Sender<QueueMessage>,
}

impl QueuePublisher {
    /// Enqueue `body`, waiting for space when the queue is full. Returns the delivery id.
    pub async fn publish(&self, body: JsonValue) -> Result<String> {
        let delivery_id = Uuid::new_v4().to_string();
        self.sender
            .send(QueueMessage {
                delivery_id: delivery_id.clone(),
                body,
            })
            .await
            .map_err(|_| IngestError::QueueClosed)?;
        Ok(delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_then_receive_in_order() {
        let queue = IngestQueue::new(8);
        let publisher = queue.publisher();

        let first = publisher.publish(json!({"n": 1})).await.unwrap();
        publisher.publish(json!({"n": 2})).await.unwrap();

        let message = queue.recv().await.unwrap();
        assert_eq!(message.delivery_id, first);
        assert_eq!(message.body["n"], 1);
        queue.ack(&message);
        assert_eq!(queue.recv().await.unwrap().body["n"], 2);
        assert_eq!(queue.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_workers() {
        let queue = IngestQueue::new(8);

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();

        let received = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
        assert!(queue.recv().await.is_none());
    }
}
