#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Notify;

use ingestion_common::health::{HealthHandle, HealthRegistry};
use ingestion_common::record::EventRecord;
use ingestion_common::retry::RetryPolicy;
use ingestion_common::store::{EventStore, StoreError, StoreResult};
use ingestion_common::trace::TRACE_ID_HEADER;
use ingestion_worker::consumer::{Delivery, MessageSource};
use ingestion_worker::error::ConsumerError;
use ingestion_worker::worker::IngestionWorker;

pub const IDLE_DELAY: Duration = Duration::from_millis(10);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker message held in memory.
#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub seq: u64,
    pub payload: Bytes,
    pub subject: String,
    pub delivery_count: u64,
    pub headers: HashMap<String, String>,
}

impl FakeMessage {
    pub fn new(seq: u64, subject: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            payload: payload.into(),
            subject: subject.to_owned(),
            delivery_count: 1,
            headers: HashMap::new(),
        }
    }

    pub fn delivered(mut self, delivery_count: u64) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn traced(mut self, trace_id: &str) -> Self {
        self.headers
            .insert(TRACE_ID_HEADER.to_owned(), trace_id.to_owned());
        self
    }
}

impl Delivery for FakeMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A `MessageSource` that hands out scripted fetch results, then empty batches,
/// and records how every message was settled.
#[derive(Default)]
pub struct FakeSource {
    fetches: Mutex<VecDeque<Result<Vec<FakeMessage>, ConsumerError>>>,
    fetch_calls: AtomicUsize,
    acked: Mutex<Vec<(u64, usize)>>,
    nacked: Mutex<Vec<(u64, Duration)>>,
    store: Option<Arc<MemoryStore>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record, with every ack, how many writes `store` had seen at that point.
    pub fn observing(store: &Arc<MemoryStore>) -> Self {
        Self {
            store: Some(store.clone()),
            ..Self::default()
        }
    }

    pub fn push_batch(&self, messages: Vec<FakeMessage>) {
        self.fetches.lock().unwrap().push_back(Ok(messages));
    }

    pub fn push_fetch_error(&self, error: &str) {
        self.fetches
            .lock()
            .unwrap()
            .push_back(Err(ConsumerError::Fetch(error.to_owned())));
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn pending_fetches(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().iter().map(|(seq, _)| *seq).collect()
    }

    /// Acked sequence numbers paired with the store's write count at ack time.
    pub fn acked_after_writes(&self) -> Vec<(u64, usize)> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, Duration)> {
        self.nacked.lock().unwrap().clone()
    }

    /// Number of messages acked or nacked so far.
    pub fn settled(&self) -> usize {
        self.acked().len() + self.nacked().len()
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    type Message = FakeMessage;

    async fn fetch(
        &self,
        _max_messages: usize,
        _max_wait: Duration,
    ) -> Result<Vec<FakeMessage>, ConsumerError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn ack(&self, message: &FakeMessage) -> Result<(), ConsumerError> {
        let writes = self.store.as_ref().map_or(0, |store| store.insert_calls());
        self.acked.lock().unwrap().push((message.seq, writes));
        Ok(())
    }

    async fn nak(&self, message: &FakeMessage, delay: Duration) -> Result<(), ConsumerError> {
        self.nacked.lock().unwrap().push((message.seq, delay));
        Ok(())
    }
}

/// An `EventStore` keyed on record id, with a switch to make every write fail.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, EventRecord>>,
    failing: AtomicBool,
    insert_calls: AtomicUsize,
    gate: Option<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write blocks until `open_gate` is called once for it.
    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<EventRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_batch(&self, records: &[EventRecord]) -> StoreResult<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolTimedOut,
            });
        }

        let mut stored = self.records.lock().unwrap();
        let mut inserted = 0;
        for record in records {
            if !stored.contains_key(&record.id) {
                stored.insert(record.id.clone(), record.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }
}

pub fn liveness() -> HealthHandle {
    HealthRegistry::new("liveness").register("ingestion_loop", time::Duration::seconds(30))
}

pub fn worker(
    source: &Arc<FakeSource>,
    store: &Arc<MemoryStore>,
) -> IngestionWorker<FakeSource, MemoryStore> {
    IngestionWorker::new(
        source.clone(),
        store.clone(),
        RetryPolicy::default(),
        100,
        Duration::from_millis(50),
        IDLE_DELAY,
        liveness(),
    )
}

pub fn facebook_top(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "eventId": event_id,
        "timestamp": "2024-05-01T10:00:00.000Z",
        "source": "facebook",
        "funnelStage": "top",
        "eventType": "ad.view",
        "data": {
            "user": {
                "userId": "u-1",
                "name": "Ada",
                "age": 36,
                "gender": "female",
                "location": { "country": "UK", "city": "London" }
            },
            "engagement": {
                "actionTime": "2024-05-01T10:00:00.000Z",
                "referrer": "newsfeed",
                "videoId": null
            }
        }
    }))
    .unwrap()
}

pub fn tiktok_bottom(event_id: &str, purchase_amount: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "eventId": event_id,
        "timestamp": "2024-05-01T11:30:00Z",
        "source": "tiktok",
        "funnelStage": "bottom",
        "eventType": "purchase",
        "data": {
            "user": { "userId": "u-2", "username": "grace", "followers": 1200 },
            "engagement": {
                "actionTime": "2024-05-01T11:30:00Z",
                "profileId": null,
                "purchasedItem": "hoodie",
                "purchaseAmount": purchase_amount
            }
        }
    }))
    .unwrap()
}

/// Well-formed JSON that does not satisfy the event contract.
pub fn invalid_event(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "eventId": event_id,
        "timestamp": "2024-05-01T10:00:00Z",
        "source": "myspace",
        "funnelStage": "top",
        "eventType": "poke",
        "data": {}
    }))
    .unwrap()
}

pub fn malformed() -> Vec<u8> {
    b"{\"eventId\": \"broken".to_vec()
}

pub async fn wait_for<F>(condition: F)
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within {WAIT_TIMEOUT:?}");
}
