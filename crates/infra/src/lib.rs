//! Infrastructure layer: circuit breaker, retry queues, storage, upstream client.

pub mod circuit;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod jobs;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod tenants;
pub mod upstream;

mod integration_tests;

pub use dispatcher::{TriggerDispatcher, TriggerOutcome, TriggerReceipt};
pub use relay::{RelayError, TriggerRelay};
