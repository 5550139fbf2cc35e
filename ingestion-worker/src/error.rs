use thiserror::Error;

/// Enumeration of errors raised while talking to the message broker.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("could not connect to the message broker after {attempts} attempts: {error}")]
    Connect { attempts: u32, error: String },
    #[error("could not provision {resource}: {error}")]
    Provision { resource: String, error: String },
    #[error("failed to fetch a batch of messages: {0}")]
    Fetch(String),
    #[error("failed to acknowledge a message: {0}")]
    Ack(String),
}

/// Enumeration of errors that end a single cycle of the ingestion loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a broker error occurred during the cycle: {0}")]
    ConsumerError(#[from] ConsumerError),
}
