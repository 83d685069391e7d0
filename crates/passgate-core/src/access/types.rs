//! ============================================================================
//! Access Types - Flow states and request outcomes
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::{HOUR_MS, MINUTE_MS};
use crate::db::MediaAlbum;
use crate::token::TokenRejection;

/// Where a single access request stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    NoGrant,
    /// Redirect issued; waiting for the user to return with the token
    AdIssued,
    Granted,
    Denied,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Granted | FlowState::Denied)
    }
}

/// Time left on a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRemaining {
    Remaining(i64),
    /// No grant, or the grant has expired
    Unknown,
}

impl TimeRemaining {
    pub fn as_ms(&self) -> Option<i64> {
        match self {
            TimeRemaining::Remaining(ms) => Some(*ms),
            TimeRemaining::Unknown => None,
        }
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeRemaining::Remaining(ms) => {
                let hours = ms / HOUR_MS;
                let minutes = (ms % HOUR_MS) / MINUTE_MS;
                write!(f, "{}h {}m", hours, minutes)
            }
            TimeRemaining::Unknown => f.write_str("unknown"),
        }
    }
}

/// Channel membership as reported by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    NotMember,
    /// Timeout or error; treated as `NotMember`
    Unknown,
}

impl Membership {
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::Member)
    }
}

/// What happened to the album a request or token referred to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentResolution {
    /// No album was requested
    None,
    Resolved(MediaAlbum),
    /// Album hash no longer exists; access is unaffected
    Missing(String),
}

/// Result of `AccessFlow::request_access`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Live grant found; no token involved
    AlreadyGranted {
        remaining: TimeRemaining,
        content: ContentResolution,
    },
    /// Ads disabled, grant written directly
    Granted {
        expires_at: i64,
        content: ContentResolution,
    },
    /// User must follow `url` and come back with `token`
    RedirectIssued { url: String, token: String },
    /// Channel membership check failed
    NotEligible,
}

impl AccessOutcome {
    pub fn state(&self) -> FlowState {
        match self {
            AccessOutcome::AlreadyGranted { .. } | AccessOutcome::Granted { .. } => {
                FlowState::Granted
            }
            AccessOutcome::RedirectIssued { .. } => FlowState::AdIssued,
            AccessOutcome::NotEligible => FlowState::NoGrant,
        }
    }
}

/// Why a redeem attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Malformed,
    Expired,
    Forged,
    OwnerMismatch,
    /// Signature valid but no ledger record
    Unknown,
    Replayed,
}

impl DenyReason {
    /// Text shown to the user; deliberately the same for every reason
    pub fn user_message(&self) -> &'static str {
        "This link is invalid or expired. Please request a new one."
    }
}

impl From<TokenRejection> for DenyReason {
    fn from(rejection: TokenRejection) -> Self {
        match rejection {
            TokenRejection::Malformed => DenyReason::Malformed,
            TokenRejection::OwnerMismatch => DenyReason::OwnerMismatch,
            TokenRejection::Expired => DenyReason::Expired,
            TokenRejection::Forged => DenyReason::Forged,
        }
    }
}

/// Result of `AccessFlow::redeem`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed {
        expires_at: i64,
        content: ContentResolution,
    },
    Denied(DenyReason),
}

impl RedeemOutcome {
    pub fn state(&self) -> FlowState {
        match self {
            RedeemOutcome::Redeemed { .. } => FlowState::Granted,
            RedeemOutcome::Denied(_) => FlowState::Denied,
        }
    }
}
