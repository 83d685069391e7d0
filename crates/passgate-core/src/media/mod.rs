//! ============================================================================
//! Media Module - Albums and self-destructing delivery
//! ============================================================================

pub mod delivery;
pub mod registry;

pub use delivery::{DeliveryReport, DeliveryScheduler, MessageRef, Payload, RetractOutcome, Sink};
pub use registry::{generate_hash, IngestReceipt, MediaRegistry, HASH_LEN};
