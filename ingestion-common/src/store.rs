//! # Store
//!
//! Persistence gateway for `EventRecord`s: one atomic bulk insert per batch, where rows whose
//! `id` already exists are skipped rather than reported as errors.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::record::EventRecord;

/// Enumeration of errors for operations with an EventStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert all `records` in a single atomic write, skipping any whose `id` is already stored.
    /// Either every new record is written or none is. Returns the number of rows actually inserted.
    async fn insert_batch(&self, records: &[EventRecord]) -> StoreResult<u64>;
}

/// An EventStore backed by a PostgreSQL table.
pub struct PgEventStore {
    table: String,
    pool: PgPool,
}

impl PgEventStore {
    /// Initialize a new PgEventStore writing to `table`, with its own connection pool.
    pub async fn new(table: &str, url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool))
    }

    /// Initialize a new PgEventStore writing to `table` using an existing pool.
    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_batch(&self, records: &[EventRecord]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut ids: Vec<&str> = Vec::with_capacity(records.len());
        let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());
        let mut sources: Vec<&str> = Vec::with_capacity(records.len());
        let mut funnel_stages: Vec<&str> = Vec::with_capacity(records.len());
        let mut event_types: Vec<&str> = Vec::with_capacity(records.len());
        let mut purchase_amounts: Vec<Option<&str>> = Vec::with_capacity(records.len());
        let mut data: Vec<serde_json::Value> = Vec::with_capacity(records.len());

        for record in records {
            ids.push(&record.id);
            timestamps.push(record.timestamp);
            sources.push(&record.source);
            funnel_stages.push(&record.funnel_stage);
            event_types.push(&record.event_type);
            purchase_amounts.push(record.purchase_amount.as_deref());
            data.push(record.data.clone());
        }

        // A single statement, so the batch is all-or-nothing without an explicit transaction.
        let query = format!(
            r#"
INSERT INTO "{0}"
    (id, timestamp, source, funnel_stage, event_type, purchase_amount, data)
    (SELECT * FROM UNNEST(
        $1::text[],
        $2::timestamptz[],
        $3::text[],
        $4::text[],
        $5::text[],
        $6::text[],
        $7::jsonb[]))
ON CONFLICT (id) DO NOTHING
            "#,
            &self.table
        );

        let result = sqlx::query(&query)
            .bind(&ids)
            .bind(&timestamps)
            .bind(&sources)
            .bind(&funnel_stages)
            .bind(&event_types)
            .bind(&purchase_amounts)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }
}
