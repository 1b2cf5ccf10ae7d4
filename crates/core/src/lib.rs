//! `relay-core`: identifiers and errors shared by the trigger relay.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{RequestId, TenantId};
