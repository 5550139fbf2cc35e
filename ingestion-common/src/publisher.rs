//! Publishing validated events onto the events stream, as the webhook gateway does.
//!
//! One message per event on `events.<source>`, deduplicated by the broker on `eventId`.
//!
//! The webhook gateway is the consumer of this module; the ingestion worker only reads the
//! stream and never calls into it.
use async_nats::jetstream;
use async_nats::HeaderMap;
use bytes::Bytes;
use thiserror::Error;
use tracing::error;

use crate::batch::EVENTS_SUBJECT_PREFIX;
use crate::event::{Event, EventSource};
use crate::trace::TRACE_ID_HEADER;

/// Largest payload the broker accepts for a single message.
pub const MAX_PAYLOAD_BYTES: usize = 5_000_000;

/// Header the broker uses as its deduplication key.
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("event size {size} exceeds max payload of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("messaging unavailable: {0}")]
    Unavailable(String),
}

pub fn subject_for(source: EventSource) -> String {
    format!("{}{}", EVENTS_SUBJECT_PREFIX, source.as_str())
}

pub fn headers_for(event: &Event, trace_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(MESSAGE_ID_HEADER, event.event_id());
    if let Some(trace_id) = trace_id {
        headers.insert(TRACE_ID_HEADER, trace_id);
    }
    headers
}

/// Serialize an event, refusing payloads the broker would reject.
pub fn encode(event: &Event) -> Result<Bytes, PublishError> {
    let payload = serde_json::to_vec(event)?;

    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(PublishError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    Ok(Bytes::from(payload))
}

pub struct EventPublisher {
    jetstream: jetstream::Context,
}

impl EventPublisher {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }

    /// Publish an event and wait for the stream to acknowledge it.
    pub async fn publish(&self, event: &Event, trace_id: Option<&str>) -> Result<(), PublishError> {
        let subject = subject_for(event.source());
        let payload = encode(event)?;
        let headers = headers_for(event, trace_id);

        let failed = |e: String| {
            error!(
                subject = %subject,
                event_id = event.event_id(),
                error = %e,
                "event_publish_failed"
            );
            PublishError::Unavailable(e)
        };

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload)
            .await
            .map_err(|e| failed(e.to_string()))?;

        ack.await.map_err(|e| failed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::validate;
    use serde_json::json;

    fn facebook_top(name: &str) -> Event {
        validate(json!({
            "eventId": "fb-7",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "facebook",
            "funnelStage": "top",
            "eventType": "ad.view",
            "data": {
                "user": {
                    "userId": "u-1",
                    "name": name,
                    "age": 30,
                    "gender": "non-binary",
                    "location": { "country": "NZ", "city": "Wellington" }
                },
                "engagement": { "actionTime": "2024-05-01T10:00:00Z", "referrer": "groups", "videoId": null }
            }
        }))
        .expect("fixture should be valid")
    }

    #[test]
    fn test_subject_is_namespaced_by_source() {
        assert_eq!(subject_for(EventSource::Facebook), "events.facebook");
        assert_eq!(subject_for(EventSource::Tiktok), "events.tiktok");
    }

    #[test]
    fn test_headers_carry_dedupe_key_and_trace_id() {
        let event = facebook_top("Kai");

        let headers = headers_for(&event, Some("trace-1"));
        assert_eq!(
            headers.get(MESSAGE_ID_HEADER).map(|v| v.as_str()),
            Some("fb-7")
        );
        assert_eq!(
            headers.get(TRACE_ID_HEADER).map(|v| v.as_str()),
            Some("trace-1")
        );

        let headers = headers_for(&event, None);
        assert!(headers.get(TRACE_ID_HEADER).is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_payloads() {
        let small = encode(&facebook_top("Kai")).expect("small events encode");
        assert!(small.len() < MAX_PAYLOAD_BYTES);

        let huge = facebook_top(&"x".repeat(MAX_PAYLOAD_BYTES));
        match encode(&huge) {
            Err(PublishError::PayloadTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_PAYLOAD_BYTES);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other.map(|b| b.len())),
        }
    }
}
