//! Shared types for the session orchestrator: canonical identifiers, trust
//! tiers, messaging backends, the crate-wide error type, structured trace
//! events, and layered configuration.

pub mod backend;
pub mod chat_id;
pub mod config;
pub mod error;
pub mod message;
pub mod tier;
pub mod trace;

pub use backend::{backend_names, get_backend, Backend};
pub use chat_id::ChatId;
pub use error::{Error, Result};
pub use message::{Attachment, Message};
pub use tier::Tier;
pub use trace::TraceEvent;
