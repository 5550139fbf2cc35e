use std::sync::Arc;
use std::time;

use ingestion_common::batch::{self, source_from_subject, BatchContext, MessageContext};
use ingestion_common::event::{classify, Outcome};
use ingestion_common::health::HealthHandle;
use ingestion_common::metrics;
use ingestion_common::record::{to_record, EventRecord};
use ingestion_common::retry::RetryPolicy;
use ingestion_common::store::{EventStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::consumer::{Delivery, MessageSource};
use crate::error::WorkerError;

/// Unprocessable payloads are logged with at most this many leading bytes.
const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// Lifecycle of the ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Shutdown was requested; the in-flight cycle is finishing.
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every candidate was written (or was already stored) and acknowledged.
    Success,
    /// The store rejected the batch; every candidate was scheduled for redelivery.
    Failed,
    /// Nothing in the batch could be processed, so nothing was written.
    Empty,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Empty => "empty",
        }
    }
}

/// Result of one cycle that fetched at least one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    /// Number of events now durably stored, including ones that were already present.
    pub persisted: usize,
}

impl BatchOutcome {
    fn new(status: BatchStatus, persisted: usize) -> Self {
        Self { status, persisted }
    }
}

/// Pulls batches from a `MessageSource`, persists the valid events to an `EventStore`
/// and settles every message it was handed.
pub struct IngestionWorker<S, St> {
    /// The durable consumer messages are fetched from and acknowledged to.
    source: Arc<S>,
    /// Where valid events are written, one atomic write per batch.
    store: Arc<St>,
    /// Computes the redelivery delay of messages whose batch could not be written.
    retry_policy: RetryPolicy,
    /// Most messages to fetch per cycle.
    batch_size: usize,
    /// Longest to wait for a batch to fill up.
    batch_expires: time::Duration,
    /// Pause after an empty fetch or a failed cycle.
    idle_delay: time::Duration,
    /// The liveness check handle, reported healthy once per cycle.
    liveness: HealthHandle,
}

impl<S, St> IngestionWorker<S, St>
where
    S: MessageSource + 'static,
    St: EventStore + 'static,
{
    pub fn new(
        source: Arc<S>,
        store: Arc<St>,
        retry_policy: RetryPolicy,
        batch_size: usize,
        batch_expires: time::Duration,
        idle_delay: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            store,
            retry_policy,
            batch_size: batch_size.max(1),
            batch_expires,
            idle_delay,
            liveness,
        }
    }

    /// Spawn the loop on the runtime. The returned handle stops it.
    pub fn start(self) -> IngestionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state, _initial) = watch::channel(LoopState::Running);
        let state = Arc::new(state);

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
            task_state.send_replace(LoopState::Stopped);
        });

        info!("ingestion_loop_started");

        IngestionHandle {
            shutdown: shutdown_tx,
            state,
            task: Some(task),
        }
    }

    /// Run cycles until `shutdown` turns true (or its sender goes away).
    /// A failing cycle is logged and followed by a pause; it never ends the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        while !shutdown_requested(&shutdown) {
            self.liveness.report_healthy();

            match self.run_cycle().await {
                Ok(None) => pause(self.idle_delay, &mut shutdown).await,
                Ok(Some(outcome)) if outcome.status == BatchStatus::Failed => {
                    pause(self.idle_delay, &mut shutdown).await
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    error!(error = %e, "ingestion_loop_failed");
                    metrics::loop_error();
                    pause(self.idle_delay, &mut shutdown).await;
                }
            }
        }

        info!("ingestion_loop_stopped");
    }

    /// Fetch one batch and settle every message in it.
    /// Returns `None` when the fetch came back empty.
    pub async fn run_cycle(&self) -> Result<Option<BatchOutcome>, WorkerError> {
        let messages = self
            .source
            .fetch(self.batch_size, self.batch_expires)
            .await?;

        if messages.is_empty() {
            return Ok(None);
        }

        let contexts: Vec<MessageContext> = messages
            .iter()
            .map(|message| {
                MessageContext::new(message.trace_id(), source_from_subject(message.subject()))
            })
            .collect();
        let context = batch::build(&contexts);

        let span = info_span!(
            "ingestion_batch",
            trace_id = %context.trace_id,
            source = %context.source,
            batch_size = context.batch_size
        );

        let outcome = self
            .process_batch(messages, &contexts, &context)
            .instrument(span)
            .await;

        Ok(Some(outcome))
    }

    async fn process_batch(
        &self,
        messages: Vec<S::Message>,
        contexts: &[MessageContext],
        context: &BatchContext,
    ) -> BatchOutcome {
        let started = time::Instant::now();

        info!(
            sources = ?context.sources,
            trace_ids = ?context.trace_ids,
            "ingestion_batch_start"
        );
        metrics::messages_received(messages.len());

        let mut candidates: Vec<(S::Message, EventRecord)> = Vec::with_capacity(messages.len());

        for (message, message_context) in messages.into_iter().zip(contexts) {
            let span = info_span!(
                "ingestion_message",
                trace_id = message_context
                    .trace_id
                    .as_deref()
                    .unwrap_or(&context.trace_id),
                source = %message_context.source,
                delivery_count = message.delivery_count()
            );

            match span.in_scope(|| admit(&message)) {
                Some(record) => candidates.push((message, record)),
                None => self.ack(&message).instrument(span).await,
            }
        }

        let (outcome, failure) = if candidates.is_empty() {
            (BatchOutcome::new(BatchStatus::Empty, 0), None)
        } else {
            match self.persist(candidates).await {
                Ok(persisted) => (BatchOutcome::new(BatchStatus::Success, persisted), None),
                Err(e) => (BatchOutcome::new(BatchStatus::Failed, 0), Some(e)),
            }
        };

        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;
        metrics::batch_completed(outcome.status.as_str(), duration);

        match failure {
            Some(e) => error!(
                status = outcome.status.as_str(),
                persisted = outcome.persisted,
                duration_ms,
                error = %e,
                "ingestion_batch_failed"
            ),
            None => info!(
                status = outcome.status.as_str(),
                persisted = outcome.persisted,
                duration_ms,
                "ingestion_batch_complete"
            ),
        }

        outcome
    }

    /// Write all candidates at once. On success acknowledge each of them and return how many
    /// are now stored; otherwise schedule each for redelivery with a delay keyed on its own
    /// delivery count.
    async fn persist(
        &self,
        candidates: Vec<(S::Message, EventRecord)>,
    ) -> Result<usize, StoreError> {
        let records: Vec<EventRecord> = candidates
            .iter()
            .map(|(_, record)| record.clone())
            .collect();

        match self.store.insert_batch(&records).await {
            Ok(inserted) => {
                for (message, _) in &candidates {
                    self.ack(message).await;
                }

                let persisted = candidates.len();
                metrics::events_persisted(inserted);
                info!(
                    persisted,
                    inserted,
                    duplicates = (persisted as u64).saturating_sub(inserted),
                    "ingestion_batch_persisted"
                );

                Ok(persisted)
            }
            Err(e) => {
                for (message, record) in &candidates {
                    let delay = self.retry_policy.next_delay(message.delivery_count());
                    if let Err(e) = self.source.nak(message, delay).await {
                        warn!(event_id = %record.id, error = %e, "ingestion_nak_failed");
                    }
                }
                metrics::messages_nacked(candidates.len());

                Err(e)
            }
        }
    }

    /// Acknowledge a message. A failed ack only means the broker redelivers it after ack-wait,
    /// where the store's duplicate skip makes the second pass harmless.
    async fn ack(&self, message: &S::Message) {
        if let Err(e) = self.source.ack(message).await {
            warn!(subject = message.subject(), error = %e, "ingestion_ack_failed");
        }
    }
}

/// Decode and validate a message. Unprocessable messages are logged and yield `None`.
fn admit<M: Delivery>(message: &M) -> Option<EventRecord> {
    let outcome = classify(message.payload());
    let reason = outcome.label();

    match outcome {
        Outcome::Valid(event) => return Some(to_record(&event)),
        Outcome::Malformed(e) => warn!(
            subject = message.subject(),
            delivery_count = message.delivery_count(),
            preview = %payload_preview(message.payload()),
            error = %e,
            "ingestion_event_decode_failed"
        ),
        Outcome::InvalidSchema(e) => warn!(
            subject = message.subject(),
            delivery_count = message.delivery_count(),
            preview = %payload_preview(message.payload()),
            error = %e,
            "ingestion_event_invalid"
        ),
    }

    metrics::message_dropped(reason);
    None
}

fn payload_preview(payload: &[u8]) -> String {
    let end = payload.len().min(PAYLOAD_PREVIEW_BYTES);
    let mut preview = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > end {
        preview.push_str("...");
    }
    preview
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay`, waking early if shutdown is requested.
async fn pause(delay: time::Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.wait_for(|stop| *stop) => {}
    }
}

/// Controls a loop spawned by `IngestionWorker::start`.
pub struct IngestionHandle {
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<LoopState>>,
    task: Option<JoinHandle<()>>,
}

impl IngestionHandle {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Follow state transitions, e.g. to wait for `Stopped` from another task.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Request shutdown and wait for the in-flight cycle, acknowledgments included, to finish.
    /// The state is `Stopping` until then and `Stopped` once this returns.
    pub async fn stop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Stopping;
                true
            } else {
                false
            }
        });
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "ingestion_loop_panicked");
            }
        }
        self.state.send_replace(LoopState::Stopped);
    }
}
