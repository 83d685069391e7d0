//! ============================================================================
//! Token Module - Signed, time-bound access tokens
//! ============================================================================
//! `codec` mints and verifies the token string; `ledger` records issuance and
//! enforces single use against the store.
//! ============================================================================

pub mod codec;
pub mod ledger;

pub use codec::{TokenClaims, TokenCodec, TOKEN_TAG};
pub use ledger::TokenLedger;

use thiserror::Error;

/// Errors raised while minting a token
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Owner ids must be non-empty and free of the field separator
    #[error("invalid owner id: {0:?}")]
    InvalidOwner(String),

    #[error("signing failed: {0}")]
    Crypto(String),
}

/// Why a token failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("malformed token")]
    Malformed,
    #[error("token owner mismatch")]
    OwnerMismatch,
    #[error("token expired")]
    Expired,
    #[error("token signature mismatch")]
    Forged,
}
