//! Relay daemon: HTTP ingest in front of the trigger relay.

pub mod dto;
pub mod http;

pub use http::{router, RelayHandles};
