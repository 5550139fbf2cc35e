//! # Consumer
//!
//! The durable pull consumer the ingestion loop reads from.
//!
//! The loop only sees the `MessageSource` and `Delivery` traits; `JetStreamSource` implements
//! them over a NATS JetStream durable consumer, provisioning the stream and the consumer on first
//! use and caching the handle for the lifetime of the process.
use std::time;

use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use ingestion_common::retry::RetryPolicy;
use ingestion_common::trace::{resolve_trace_id, TRACE_ID_HEADER};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{ConsumerConfig, NatsConfig};
use crate::error::ConsumerError;

/// Connection backoff never waits longer than this between attempts.
const MAX_CONNECT_DELAY: time::Duration = time::Duration::from_secs(30);

/// A message handed out by the broker, as seen by the ingestion loop.
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    fn subject(&self) -> &str;

    /// How many times the broker has delivered this message, starting at 1.
    fn delivery_count(&self) -> u64;

    fn header(&self, name: &str) -> Option<&str>;

    /// Trace id propagated by the publisher, if any.
    fn trace_id(&self) -> Option<String> {
        resolve_trace_id(self.header(TRACE_ID_HEADER))
    }
}

/// A durable, explicitly acknowledged source of messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    type Message: Delivery;

    /// Fetch up to `max_messages`, waiting at most `max_wait`. Timing out with nothing
    /// available yields an empty batch, not an error.
    async fn fetch(
        &self,
        max_messages: usize,
        max_wait: time::Duration,
    ) -> Result<Vec<Self::Message>, ConsumerError>;

    /// Remove the message from the stream for good.
    async fn ack(&self, message: &Self::Message) -> Result<(), ConsumerError>;

    /// Ask the broker to redeliver the message once `delay` has passed.
    async fn nak(&self, message: &Self::Message, delay: time::Duration)
        -> Result<(), ConsumerError>;
}

impl Delivery for jetstream::Message {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn delivery_count(&self) -> u64 {
        self.info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok())
            .unwrap_or(1)
            .max(1)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str())
    }
}

/// Connect to NATS, retrying with exponential backoff: `min(delay * 2^(attempt-1), 30s)`.
pub async fn connect_with_retry(config: &NatsConfig) -> Result<async_nats::Client, ConsumerError> {
    let retry_policy = RetryPolicy::build(2, config.connect_retry_delay.0)
        .maximum_interval(MAX_CONNECT_DELAY)
        .provide();
    let max_attempts = config.connect_max_retries.max(1);
    let url = config.url.as_str();

    let mut attempt = 1;
    loop {
        let options = async_nats::ConnectOptions::new().event_callback(|event| async move {
            info!(event = %event, "nats_status");
        });

        match options.connect(url).await {
            Ok(client) => {
                info!(url, attempt, "nats_connected");
                return Ok(client);
            }
            Err(error) if attempt < max_attempts => {
                let delay = retry_policy.next_delay(attempt as u64);
                warn!(
                    url,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "nats_connect_failed"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(url, attempt, max_attempts, error = %error, "nats_connect_failed");
                return Err(ConsumerError::Connect {
                    attempts: attempt,
                    error: error.to_string(),
                });
            }
        }
    }
}

/// A `MessageSource` backed by a JetStream durable pull consumer.
pub struct JetStreamSource {
    jetstream: jetstream::Context,
    config: ConsumerConfig,
    consumer: OnceCell<consumer::PullConsumer>,
}

impl JetStreamSource {
    pub fn new(client: async_nats::Client, config: ConsumerConfig) -> Self {
        Self {
            jetstream: jetstream::new(client),
            config,
            consumer: OnceCell::new(),
        }
    }

    /// Create the stream and the durable consumer unless they already exist.
    /// Succeeds at most once per process; later calls return the cached consumer.
    pub async fn ensure_ready(&self) -> Result<&consumer::PullConsumer, ConsumerError> {
        self.consumer.get_or_try_init(|| self.provision()).await
    }

    async fn provision(&self) -> Result<consumer::PullConsumer, ConsumerError> {
        let stream_name = self.config.stream_name.as_str();
        let subject = self.config.subject.as_str();
        let durable_name = self.config.durable_name.as_str();

        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: stream_name.to_owned(),
                subjects: vec![subject.to_owned()],
                max_age: self.config.stream_max_age.0,
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| ConsumerError::Provision {
                resource: format!("stream {}", stream_name),
                error: e.to_string(),
            })?;

        info!(stream = stream_name, subject, "events_stream_ready");

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                consumer::pull::Config {
                    durable_name: Some(durable_name.to_owned()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    deliver_policy: consumer::DeliverPolicy::All,
                    replay_policy: consumer::ReplayPolicy::Instant,
                    filter_subject: subject.to_owned(),
                    ack_wait: self.config.ack_wait.0,
                    max_ack_pending: self.config.max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ConsumerError::Provision {
                resource: format!("consumer {}", durable_name),
                error: e.to_string(),
            })?;

        info!(
            stream = stream_name,
            consumer = durable_name,
            ack_wait_ms = self.config.ack_wait.0.as_millis() as u64,
            max_ack_pending = self.config.max_ack_pending,
            "events_consumer_ready"
        );

        Ok(consumer)
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    type Message = jetstream::Message;

    async fn fetch(
        &self,
        max_messages: usize,
        max_wait: time::Duration,
    ) -> Result<Vec<Self::Message>, ConsumerError> {
        let consumer = self.ensure_ready().await?;

        let mut batch = consumer
            .batch()
            .max_messages(max_messages)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| ConsumerError::Fetch(e.to_string()))?;

        let mut messages = Vec::with_capacity(max_messages);
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => messages.push(message),
                // Keep what was already received so it still gets acknowledged this cycle.
                Err(e) if !messages.is_empty() => {
                    warn!(received = messages.len(), error = %e, "events_fetch_interrupted");
                    break;
                }
                Err(e) => return Err(ConsumerError::Fetch(e.to_string())),
            }
        }

        Ok(messages)
    }

    async fn ack(&self, message: &Self::Message) -> Result<(), ConsumerError> {
        message
            .ack()
            .await
            .map_err(|e| ConsumerError::Ack(e.to_string()))
    }

    async fn nak(
        &self,
        message: &Self::Message,
        delay: time::Duration,
    ) -> Result<(), ConsumerError> {
        message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| ConsumerError::Ack(e.to_string()))
    }
}
