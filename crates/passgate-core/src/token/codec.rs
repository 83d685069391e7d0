//! Token string codec.
//!
//! Wire form: `t{issued_at}-{owner_id}-{sig}` where `sig` is the first 16
//! lowercase hex characters of HMAC-SHA256(secret, "{owner_id}:{issued_at}").
//! Expiry is measured from the embedded `issued_at`, so a token verifies even
//! before (or without) a ledger record.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use super::{TokenError, TokenRejection};
use crate::clock::Clock;
use crate::config::TokenPolicy;

type HmacSha256 = Hmac<Sha256>;

/// Leading tag character of every token
pub const TOKEN_TAG: char = 't';

/// Hex characters kept from the MAC
const SIGNATURE_HEX_LEN: usize = 16;

/// Fields recovered from a token that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub issued_at: i64,
    pub owner_id: String,
}

#[derive(Clone)]
pub struct TokenCodec {
    policy: TokenPolicy,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(policy: TokenPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Mint a token for `owner_id` stamped with the current time
    pub fn mint(&self, owner_id: &str) -> Result<String, TokenError> {
        self.mint_at(owner_id, self.clock.now_ms())
    }

    pub fn mint_at(&self, owner_id: &str, issued_at: i64) -> Result<String, TokenError> {
        if owner_id.is_empty() || owner_id.contains('-') {
            return Err(TokenError::InvalidOwner(owner_id.to_string()));
        }
        let sig = self.signature(owner_id, issued_at)?;
        Ok(format!("{}{}-{}-{}", TOKEN_TAG, issued_at, owner_id, sig))
    }

    /// Fail-closed check used by the redeem path
    pub fn verify(&self, token: &str, expected_owner: &str) -> bool {
        self.inspect(token, expected_owner).is_ok()
    }

    /// Run every check and report the first one that failed
    pub fn inspect(&self, token: &str, expected_owner: &str) -> Result<TokenClaims, TokenRejection> {
        let (issued_at, owner_id, sig) = parse(token).ok_or(TokenRejection::Malformed)?;

        if owner_id != expected_owner {
            return Err(TokenRejection::OwnerMismatch);
        }

        let age = self.clock.now_ms().saturating_sub(issued_at);
        if age > self.policy.ttl_ms() {
            return Err(TokenRejection::Expired);
        }

        if !self.signature_matches(owner_id, issued_at, sig) {
            return Err(TokenRejection::Forged);
        }

        Ok(TokenClaims {
            issued_at,
            owner_id: owner_id.to_string(),
        })
    }

    fn mac(&self, owner_id: &str, issued_at: i64) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(self.policy.secret())
            .map_err(|e| TokenError::Crypto(format!("HMAC init failed: {}", e)))?;
        mac.update(format!("{}:{}", owner_id, issued_at).as_bytes());
        Ok(mac)
    }

    fn signature(&self, owner_id: &str, issued_at: i64) -> Result<String, TokenError> {
        let digest = self.mac(owner_id, issued_at)?.finalize().into_bytes();
        Ok(hex::encode(&digest[..SIGNATURE_HEX_LEN / 2]))
    }

    fn signature_matches(&self, owner_id: &str, issued_at: i64, sig: &str) -> bool {
        // hex::decode accepts uppercase; the wire form is lowercase only
        let lowercase_hex = sig.len() == SIGNATURE_HEX_LEN
            && sig.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !lowercase_hex {
            return false;
        }
        let Ok(tag) = hex::decode(sig) else {
            return false;
        };
        match self.mac(owner_id, issued_at) {
            Ok(mac) => mac.verify_truncated_left(&tag).is_ok(),
            Err(_) => false,
        }
    }
}

/// Split `t{issued_at}-{owner}-{sig}` into its three fields
fn parse(token: &str) -> Option<(i64, &str, &str)> {
    let body = token.strip_prefix(TOKEN_TAG)?;
    let mut fields = body.split('-');
    let issued = fields.next()?;
    let owner = fields.next()?;
    let sig = fields.next()?;
    if fields.next().is_some() || owner.is_empty() {
        return None;
    }
    if issued.is_empty() || !issued.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let issued_at = issued.parse().ok()?;
    Some((issued_at, owner, sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, HOUR_MS};
    use crate::config::DEFAULT_TOKEN_TTL_MS;

    const T0: i64 = 1_700_000_000_000;

    fn codec() -> (Arc<ManualClock>, TokenCodec) {
        let clock = Arc::new(ManualClock::new(T0));
        let policy = TokenPolicy::new("test-secret-0123456789", DEFAULT_TOKEN_TTL_MS).unwrap();
        (clock.clone(), TokenCodec::new(policy, clock))
    }

    #[test]
    fn test_mint_format() {
        let (_clock, codec) = codec();
        let token = codec.mint("42").unwrap();
        let parts: Vec<&str> = token.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], format!("t{}", T0));
        assert_eq!(parts[1], "42");
        assert_eq!(parts[2].len(), 16);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_mint_then_verify() {
        let (_clock, codec) = codec();
        for owner in ["1", "42", "987654321", "user_abc"] {
            let token = codec.mint(owner).unwrap();
            assert!(codec.verify(&token, owner));
            assert!(!codec.verify(&token, "someone_else"));
        }
    }

    #[test]
    fn test_rejects_bad_owner_ids() {
        let (_clock, codec) = codec();
        assert!(matches!(codec.mint(""), Err(TokenError::InvalidOwner(_))));
        assert!(matches!(codec.mint("-100123"), Err(TokenError::InvalidOwner(_))));
    }

    #[test]
    fn test_expiry_boundary() {
        let (clock, codec) = codec();
        let token = codec.mint("42").unwrap();

        clock.set(T0 + DEFAULT_TOKEN_TTL_MS - 1);
        assert!(codec.verify(&token, "42"));
        clock.set(T0 + DEFAULT_TOKEN_TTL_MS);
        assert!(codec.verify(&token, "42"));
        clock.set(T0 + DEFAULT_TOKEN_TTL_MS + 1);
        assert_eq!(codec.inspect(&token, "42"), Err(TokenRejection::Expired));
    }

    #[test]
    fn test_expiry_is_relative_to_issue_time() {
        let (clock, codec) = codec();
        let token = codec.mint_at("42", T0 - 17 * HOUR_MS).unwrap();
        assert!(codec.verify(&token, "42"));
        clock.advance(2 * HOUR_MS);
        assert!(!codec.verify(&token, "42"));
    }

    #[test]
    fn test_single_char_mutation_in_signature() {
        let (_clock, codec) = codec();
        let token = codec.mint("42").unwrap();
        let sig_start = token.rfind('-').unwrap() + 1;

        for i in sig_start..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert_eq!(codec.inspect(&mutated, "42"), Err(TokenRejection::Forged));
        }
    }

    #[test]
    fn test_uppercase_signature_rejected() {
        let (_clock, codec) = codec();
        let token = codec.mint("42").unwrap();
        let sig_start = token.rfind('-').unwrap() + 1;
        let upper = format!("{}{}", &token[..sig_start], token[sig_start..].to_uppercase());
        if upper != token {
            assert!(!codec.verify(&upper, "42"));
        }
    }

    #[test]
    fn test_malformed_tokens() {
        let (_clock, codec) = codec();
        for bad in [
            "",
            "t",
            "x1700000000000-42-0123456789abcdef",
            "t1700000000000-42",
            "t1700000000000-42-0123456789abcdef-extra",
            "tabc-42-0123456789abcdef",
            "t-5-42-0123456789abcdef",
            "t1700000000000--0123456789abcdef",
        ] {
            assert_eq!(codec.inspect(bad, "42"), Err(TokenRejection::Malformed), "{}", bad);
        }
    }

    #[test]
    fn test_other_secret_is_forged() {
        let (clock, codec) = codec();
        let other = TokenCodec::new(
            TokenPolicy::new("another-secret-abcdef", DEFAULT_TOKEN_TTL_MS).unwrap(),
            clock,
        );
        let token = other.mint("42").unwrap();
        assert_eq!(codec.inspect(&token, "42"), Err(TokenRejection::Forged));
    }
}
