pub mod batch;
pub mod event;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod record;
pub mod retry;
pub mod store;
pub mod trace;
