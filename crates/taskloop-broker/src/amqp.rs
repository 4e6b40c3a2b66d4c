use crate::{submit_with_retry, AckHandle, Broker, Delivery, DeliveryStream};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use taskloop_contracts::{TaskEnvelope, TaskError};

/// AMQP transport (RabbitMQ or compatible broker), the durable production
/// backend. Connection is shared across publishers; each `consume` call
/// opens its own channel and queue declaration, mirroring the per-consumer
/// channel convention used by AMQP client libraries generally.
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, TaskError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("AMQP connect failed: {e}")))?;
        Ok(Self { connection })
    }

    async fn channel(&self) -> Result<Channel, TaskError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("AMQP channel failed: {e}")))
    }
}

struct AmqpAckHandle {
    channel: Channel,
    delivery_tag: u64,
}

#[async_trait]
impl AckHandle for AmqpAckHandle {
    async fn ack(&self) -> Result<(), TaskError> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("ack failed: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<(), TaskError> {
        self.channel
            .basic_nack(self.delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("nack failed: {e}")))
    }
}

fn is_transient(err: &TaskError) -> bool {
    matches!(err, TaskError::BrokerUnavailable(_))
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn startup(&self) -> Result<(), TaskError> {
        // `Connection::connect` already established the session; nothing
        // further to do. Idempotent by construction.
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TaskError> {
        self.connection
            .close(0, "shutdown")
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("close failed: {e}")))
    }

    async fn submit(&self, envelope: TaskEnvelope) -> Result<(), TaskError> {
        let envelope = Arc::new(envelope);
        submit_with_retry(
            || {
                let envelope = envelope.clone();
                async move {
                    let channel = self.channel().await?;
                    channel
                        .queue_declare(
                            &envelope.queue_name,
                            QueueDeclareOptions { durable: true, ..Default::default() },
                            FieldTable::default(),
                        )
                        .await
                        .map_err(|e| TaskError::broker_unavailable(format!("queue_declare failed: {e}")))?;

                    let payload = serde_json::to_vec(envelope.as_ref())
                        .map_err(|e| TaskError::Internal(e.into()))?;

                    let props = BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_header(
                            FieldTable::from(std::collections::BTreeMap::from([
                                ("task_id".into(), envelope.task_id.to_string().into()),
                                ("task_name".into(), envelope.task_name.clone().into()),
                            ])),
                        );

                    channel
                        .basic_publish(
                            "",
                            &envelope.queue_name,
                            BasicPublishOptions::default(),
                            &payload,
                            props,
                        )
                        .await
                        .map_err(|e| TaskError::broker_unavailable(format!("publish failed: {e}")))?
                        .await
                        .map_err(|e| TaskError::broker_unavailable(format!("publish confirm failed: {e}")))?;

                    Ok(())
                }
            },
            is_transient,
        )
        .await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TaskError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("queue_declare failed: {e}")))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("qos failed: {e}")))?;

        let consumer_tag = format!("taskloop-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TaskError::broker_unavailable(format!("consume failed: {e}")))?;

        let channel = channel.clone();
        let stream = consumer.filter_map(move |delivery| {
            let channel = channel.clone();
            async move {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => return Some(Err(TaskError::broker_unavailable(format!("delivery error: {e}")))),
                };
                let envelope: TaskEnvelope = match serde_json::from_slice(&delivery.data) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to decode envelope, nacking without requeue");
                        let _ = channel
                            .basic_nack(
                                delivery.delivery_tag,
                                BasicNackOptions { requeue: false, ..Default::default() },
                            )
                            .await;
                        return None;
                    }
                };
                let handle = Box::new(AmqpAckHandle { channel, delivery_tag: delivery.delivery_tag })
                    as Box<dyn AckHandle>;
                let item: Result<Delivery, TaskError> = Ok((envelope, handle));
                Some(item)
            }
        });

        Ok(Box::pin(stream))
    }
}
