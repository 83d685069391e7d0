//! ============================================================================
//! Access Module - Time-limited passes
//! ============================================================================
//! Decides whether a user may see content right now, and walks users without
//! a pass through eligibility, the optional ad gate and token redemption.
//!
//! ## Flow
//! - **NoGrant**: no live pass; check channel membership, then (ads enabled)
//!   mint a token and ask the gate for a redirect
//! - **AdIssued**: redirect handed out; waiting for the user to return
//! - **Granted** / **Denied**: terminal for the request
//!
//! ## Usage
//! ```rust,ignore
//! use passgate_core::access::{AccessFlow, AccessOutcome};
//!
//! match flow.request_access(&user_id, Some(&hash)).await? {
//!     AccessOutcome::RedirectIssued { url, .. } => send_button(url),
//!     other => handle(other),
//! }
//! ```
//! ============================================================================

pub mod checker;
pub mod flow;
pub mod gate;
pub mod grants;
pub mod types;

pub use checker::{check_all_channels, BotApiMembership, MembershipOracle};
pub use flow::{AccessFlow, FlowParts};
pub use gate::{ExternalGate, ShortenerGate};
pub use grants::GrantStore;
pub use types::{
    AccessOutcome, ContentResolution, DenyReason, FlowState, Membership, RedeemOutcome,
    TimeRemaining,
};
