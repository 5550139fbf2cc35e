use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::event::Event;

/// A storage-bound row derived from a validated `Event`.
/// `id` is the event's `eventId`: inserting an `id` that already exists is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub funnel_stage: String,
    pub event_type: String,
    pub purchase_amount: Option<String>,
    pub data: serde_json::Value,
}

/// Map a validated event to the record we persist.
///
/// Events with an unparseable timestamp are still ingested, stamped with the ingestion time.
pub fn to_record(event: &Event) -> EventRecord {
    let timestamp = parse_timestamp(event.timestamp()).unwrap_or_else(|| {
        warn!(
            value = event.timestamp(),
            event_id = event.event_id(),
            "ingestion_event_invalid_timestamp"
        );
        Utc::now()
    });

    EventRecord {
        id: event.event_id().to_owned(),
        timestamp,
        source: event.source().as_str().to_owned(),
        funnel_stage: event.funnel_stage().as_str().to_owned(),
        event_type: event.event_type().to_owned(),
        purchase_amount: extract_purchase_amount(event),
        // Serializing an in-memory Event cannot fail: every field is a plain JSON value.
        data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
    }
}

/// Parse an ISO-8601 timestamp, accepting the looser forms producers commonly send:
/// a full RFC 3339 date-time, a date-time without offset (taken as UTC), or a bare date.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Absent, null and empty purchase amounts all normalize to `None`.
pub fn extract_purchase_amount(event: &Event) -> Option<String> {
    event
        .purchase_amount()
        .filter(|amount| !amount.is_empty())
        .map(str::to_owned)
}
