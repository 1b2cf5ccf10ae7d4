//! Pending trigger jobs and their durable storage.
//!
//! - `TriggerRequest`: what the write path submits
//! - `PendingTriggerJob`: a trigger awaiting upstream acceptance
//! - `PendingTriggerStore`: tenant-scoped persistence (in-memory or Postgres)

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresPendingTriggerStore;
pub use store::{InMemoryPendingTriggerStore, PendingTriggerStore, StoreError};
pub use types::{PendingTriggerJob, TriggerRequest};
