use crate::{AckHandle, Broker, Delivery, DeliveryStream};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use taskloop_contracts::{TaskEnvelope, TaskError};
use tokio::sync::{mpsc, RwLock};

/// In-process broker backed by per-queue `mpsc` channels. FIFO within a
/// queue, at-least-once only when a consumer nacks with `requeue=true`
/// (there is no redelivery-on-crash since state lives in memory) --
/// intended for tests and single-process deployments, not production
/// durability.
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, mpsc::UnboundedSender<TaskEnvelope>>>,
    receivers: RwLock<HashMap<String, Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskEnvelope>>>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            receivers: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, queue: &str) -> mpsc::UnboundedSender<TaskEnvelope> {
        if let Some(tx) = self.queues.read().await.get(queue) {
            return tx.clone();
        }
        let mut queues = self.queues.write().await;
        if let Some(tx) = queues.get(queue) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(queue.to_string(), tx.clone());
        self.receivers
            .write()
            .await
            .insert(queue.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
        tx
    }
}

struct InMemoryAckHandle {
    queue: String,
    envelope: TaskEnvelope,
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

#[async_trait]
impl AckHandle for InMemoryAckHandle {
    async fn ack(&self) -> Result<(), TaskError> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TaskError> {
        if requeue {
            self.sender.send(self.envelope.clone()).map_err(|_| {
                TaskError::broker_unavailable(format!("queue '{}' closed", self.queue))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn startup(&self) -> Result<(), TaskError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TaskError> {
        Ok(())
    }

    async fn submit(&self, envelope: TaskEnvelope) -> Result<(), TaskError> {
        let tx = self.sender_for(&envelope.queue_name).await;
        tx.send(envelope)
            .map_err(|_| TaskError::broker_unavailable("in-memory queue closed"))
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<DeliveryStream, TaskError> {
        self.sender_for(queue).await;
        let rx = self
            .receivers
            .read()
            .await
            .get(queue)
            .cloned()
            .expect("sender_for registers the receiver");
        let queue = queue.to_string();

        let sender = self
            .queues
            .read()
            .await
            .get(&queue)
            .cloned()
            .expect("sender_for registers the queue");

        let s = stream::unfold((rx, queue, sender), |(rx, queue, sender)| async move {
            let mut guard = rx.lock().await;
            let envelope = guard.recv().await?;
            drop(guard);
            let item: Result<Delivery, TaskError> = Ok((
                envelope.clone(),
                Box::new(InMemoryAckHandle { queue: queue.clone(), envelope, sender: sender.clone() })
                    as Box<dyn AckHandle>,
            ));
            Some((item, (rx, queue, sender)))
        });
        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use taskloop_contracts::TaskEnvelope;

    #[tokio::test]
    async fn submit_then_consume_fifo() {
        let broker = InMemoryBroker::new();
        let e1 = TaskEnvelope::new("export_csv", "default", 3);
        let e2 = TaskEnvelope::new("export_csv", "default", 3);
        broker.submit(e1.clone()).await.unwrap();
        broker.submit(e2.clone()).await.unwrap();

        let mut stream = broker.consume("default", 1).await.unwrap();
        let (first, _) = stream.next().await.unwrap().unwrap();
        let (second, _) = stream.next().await.unwrap().unwrap();
        assert_eq!(first.task_id, e1.task_id);
        assert_eq!(second.task_id, e2.task_id);
    }
}
