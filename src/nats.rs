use crate::queue::{Delivery, END_PROCESSING_PAYLOAD, JobQueue, QueueError};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::instrument;

use async_nats::jetstream::{
    self, AckKind,
    consumer::{PullConsumer, pull},
};

/// Job queue on a JetStream work stream. Unacknowledged messages are
/// redelivered by the broker after its ack-wait, which is what gives the
/// consumer its at-least-once behavior.
pub struct NatsQueue {
    context: jetstream::Context,
    stream: Mutex<jetstream::stream::Stream>,
    consumer: PullConsumer,
    messages: Mutex<Option<pull::Stream>>,
    subject: String,
}

impl NatsQueue {
    pub async fn connect(uri: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = async_nats::connect(uri)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: queue_name.to_string(),
                subjects: vec![queue_name.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                queue_name,
                pull::Config {
                    durable_name: Some(queue_name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        Ok(Self {
            context,
            stream: Mutex::new(stream),
            consumer,
            messages: Mutex::new(None),
            subject: queue_name.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn receive(&self) -> Result<Box<dyn Delivery>, QueueError> {
        let mut messages = self.messages.lock().await;
        if messages.is_none() {
            let stream = self
                .consumer
                .messages()
                .await
                .map_err(|e| QueueError::Receive(e.to_string()))?;
            *messages = Some(stream);
        }
        // Guard stays held across the wait: one in-flight receive at a time,
        // the broker hands each message to exactly one caller.
        let stream = messages.as_mut().ok_or(QueueError::Closed)?;
        match stream.next().await {
            Some(Ok(message)) => Ok(Box::new(NatsDelivery { message })),
            Some(Err(e)) => Err(QueueError::Receive(e.to_string())),
            None => Err(QueueError::Closed),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| QueueError::Receive(e.to_string()))?;
        Ok(info.state.messages)
    }

    #[instrument(skip(self), fields(subject = %self.subject))]
    async fn publish_end_sentinel(&self) -> Result<(), QueueError> {
        let ack = self
            .context
            .publish(self.subject.clone(), END_PROCESSING_PAYLOAD.into())
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;
        ack.await.map_err(|e| QueueError::Publish(e.to_string()))?;
        Ok(())
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        self.message.payload.as_ref()
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
        let kind = if requeue {
            AckKind::Nak(None)
        } else {
            AckKind::Term
        };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }
}
