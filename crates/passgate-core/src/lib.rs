//! ============================================================================
//! PASSGATE-CORE: Time-boxed media passes
//! ============================================================================
//! This crate holds the pass logic the chat transport calls into:
//! - Signed, time-bound access tokens and a single-use token ledger
//! - 18-hour access grants with lazy expiry
//! - Channel eligibility and the optional ad gate
//! - Hash-addressed albums delivered as self-destructing messages
//! ============================================================================

pub mod access;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod service;
pub mod token;
pub mod users;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use access::{AccessFlow, GrantStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigHandle, GateConfig, LinkBuilder, TokenPolicy};
pub use db::{MemoryDb, PassBackend, PassDb};
pub use error::{GateError, SinkError, StoreError};
pub use media::{DeliveryScheduler, MediaRegistry, Sink};
pub use service::{PassService, ServiceParts, StartParam, StartReply, StartRequest};
pub use token::{TokenCodec, TokenLedger};
pub use users::UserDirectory;
