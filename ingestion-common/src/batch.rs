//! Observability context for one fetched batch.
use serde::Serialize;

use crate::trace::new_trace_id;

/// Reported as `source` when a batch carries events from more than one source.
pub const MIXED_SOURCE: &str = "mixed";

/// Subject prefix the gateway publishes under, followed by the event source.
pub const EVENTS_SUBJECT_PREFIX: &str = "events.";

/// Derive a message's source from its subject: `events.<source>`, or the whole subject otherwise.
pub fn source_from_subject(subject: &str) -> &str {
    subject
        .strip_prefix(EVENTS_SUBJECT_PREFIX)
        .unwrap_or(subject)
}

/// What the batch builder needs to know about each message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub trace_id: Option<String>,
    pub source: String,
}

impl MessageContext {
    pub fn new(trace_id: Option<String>, source: impl Into<String>) -> Self {
        Self {
            trace_id,
            source: source.into(),
        }
    }
}

/// Context attached to every log line of a batch.
///
/// `sources` is only present for mixed batches and `trace_ids` only when more than one
/// distinct trace id was seen. `trace_id` is the id used for the batch's own span: the first
/// distinct id in fetch order, so with several ids the others only show up in `trace_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchContext {
    pub batch_size: usize,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_ids: Option<Vec<String>>,
    #[serde(skip)]
    pub trace_id: String,
}

/// Group per-message trace ids and sources into one `BatchContext`.
/// Distinct values keep the order they were first seen in.
pub fn build<'a, I>(messages: I) -> BatchContext
where
    I: IntoIterator<Item = &'a MessageContext>,
{
    let mut batch_size = 0;
    let mut sources: Vec<String> = Vec::new();
    let mut trace_ids: Vec<String> = Vec::new();

    for message in messages {
        batch_size += 1;
        push_distinct(&mut sources, &message.source);
        if let Some(trace_id) = &message.trace_id {
            push_distinct(&mut trace_ids, trace_id);
        }
    }

    let trace_id = trace_ids.first().cloned().unwrap_or_else(new_trace_id);

    let (source, sources) = match sources.len() {
        1 => (sources.remove(0), None),
        _ => (MIXED_SOURCE.to_owned(), Some(sources)),
    };

    BatchContext {
        batch_size,
        source,
        sources: sources.filter(|sources| sources.len() > 1),
        trace_ids: Some(trace_ids).filter(|ids| ids.len() > 1),
        trace_id,
    }
}

fn push_distinct(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|existing| existing == value) {
        values.push(value.to_owned());
    }
}
