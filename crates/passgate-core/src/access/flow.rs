//! ============================================================================
//! Access Flow - Grant, ad gate and token redemption
//! ============================================================================
//! Request path:
//!   live grant?        -> AlreadyGranted (no token touched)
//!   not eligible?      -> NotEligible
//!   ads disabled?      -> grant directly
//!   otherwise          -> mint, ask the gate for a redirect, record the token
//!
//! Redeem path runs verify -> lookup -> activate -> grant in that order.
//! Content bound to a token is resolved separately; a miss never undoes the
//! grant.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::checker::{check_all_channels, MembershipOracle};
use super::gate::ExternalGate;
use super::grants::GrantStore;
use super::types::{AccessOutcome, ContentResolution, DenyReason, RedeemOutcome};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::GateError;
use crate::media::registry::MediaRegistry;
use crate::token::{TokenCodec, TokenLedger, TokenRejection};

/// Collaborators the flow is wired from
pub struct FlowParts {
    pub config: ConfigHandle,
    pub clock: Arc<dyn Clock>,
    pub codec: TokenCodec,
    pub ledger: TokenLedger,
    pub grants: Arc<GrantStore>,
    pub registry: Arc<MediaRegistry>,
    pub gate: Arc<dyn ExternalGate>,
    pub membership: Arc<dyn MembershipOracle>,
}

pub struct AccessFlow {
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    codec: TokenCodec,
    ledger: TokenLedger,
    grants: Arc<GrantStore>,
    registry: Arc<MediaRegistry>,
    gate: Arc<dyn ExternalGate>,
    membership: Arc<dyn MembershipOracle>,
}

impl AccessFlow {
    pub fn new(parts: FlowParts) -> Self {
        Self {
            config: parts.config,
            clock: parts.clock,
            codec: parts.codec,
            ledger: parts.ledger,
            grants: parts.grants,
            registry: parts.registry,
            gate: parts.gate,
            membership: parts.membership,
        }
    }

    pub fn grants(&self) -> &Arc<GrantStore> {
        &self.grants
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Entry point for a user asking for access, optionally to one album
    pub async fn request_access(
        &self,
        user_id: &str,
        media_hash: Option<&str>,
    ) -> Result<AccessOutcome, GateError> {
        let snapshot = self.config.snapshot();
        let config = &snapshot.config;

        if self.grants.is_active(user_id)? {
            debug!("User {} already has access", user_id);
            let remaining = self.grants.time_remaining(user_id)?;
            let content = self.resolve(media_hash).await;
            return Ok(AccessOutcome::AlreadyGranted { remaining, content });
        }

        let eligible = check_all_channels(
            self.membership.as_ref(),
            &config.channels,
            user_id,
            Duration::from_millis(config.membership_timeout_ms),
        )
        .await;
        if !eligible {
            info!("User {} is not a member of the required channels", user_id);
            return Ok(AccessOutcome::NotEligible);
        }

        if !config.ad_enabled {
            let grant = self.grants.grant(user_id, config.access_window_ms)?;
            let content = self.resolve(media_hash).await;
            return Ok(AccessOutcome::Granted {
                expires_at: grant.expires,
                content,
            });
        }

        let token = self.codec.mint(user_id)?;
        let long_url = config.links().redeem_link(&token);
        let timeout_ms = config.gate_timeout_ms;

        let short_url = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.gate.request_redirect(&long_url),
        )
        .await
        {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                warn!("External gate failed for {}: {}", user_id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("External gate timed out for {} after {}ms", user_id, timeout_ms);
                return Err(GateError::GateTimeout(timeout_ms));
            }
        };

        let expires_at = self.clock.now_ms().saturating_add(self.codec.policy().ttl_ms());
        self.ledger.record(&token, user_id, media_hash, expires_at)?;
        info!("Issued ad redirect for {}", user_id);

        Ok(AccessOutcome::RedirectIssued {
            url: short_url,
            token,
        })
    }

    /// User came back through the redirect carrying `token`
    pub async fn redeem(&self, user_id: &str, token: &str) -> Result<RedeemOutcome, GateError> {
        if let Err(rejection) = self.codec.inspect(token, user_id) {
            match rejection {
                TokenRejection::Forged => {
                    warn!("Forged token presented by {}", user_id)
                }
                TokenRejection::OwnerMismatch => {
                    warn!("User {} presented a token issued to someone else", user_id)
                }
                _ => debug!("Token from {} rejected: {}", user_id, rejection),
            }
            return Ok(RedeemOutcome::Denied(rejection.into()));
        }

        let record = match self.ledger.lookup(token)? {
            None => {
                debug!("Valid token from {} has no ledger record", user_id);
                return Ok(RedeemOutcome::Denied(DenyReason::Unknown));
            }
            Some(record) if record.used => {
                info!("Replayed token from {}", user_id);
                return Ok(RedeemOutcome::Denied(DenyReason::Replayed));
            }
            Some(record) => record,
        };
        if record.owner_id != user_id {
            warn!("Ledger owner mismatch for token presented by {}", user_id);
            return Ok(RedeemOutcome::Denied(DenyReason::OwnerMismatch));
        }

        // Sole serialization point: a concurrent redeem may have won since lookup
        let Some(record) = self.ledger.activate_record(token)? else {
            info!("Lost activation race for {}", user_id);
            return Ok(RedeemOutcome::Denied(DenyReason::Replayed));
        };

        let window = self.config.snapshot().config.access_window_ms;
        let grant = self.grants.grant(user_id, window)?;
        let content = self.resolve(record.media_hash.as_deref()).await;

        Ok(RedeemOutcome::Redeemed {
            expires_at: grant.expires,
            content,
        })
    }

    /// Look up the requested album and count the view. Never fails: a store
    /// error here degrades content, not access.
    async fn resolve(&self, media_hash: Option<&str>) -> ContentResolution {
        let Some(hash) = media_hash.filter(|h| !h.is_empty()) else {
            return ContentResolution::None;
        };
        match self.registry.find_by_hash(hash).await {
            Ok(Some(album)) => {
                if let Err(e) = self.registry.track_view(hash) {
                    warn!("Failed to count view of {}: {}", hash, e);
                }
                ContentResolution::Resolved(album)
            }
            Ok(None) => {
                info!("Album {} is no longer available", hash);
                ContentResolution::Missing(hash.to_string())
            }
            Err(e) => {
                warn!("Failed to resolve album {}: {}", hash, e);
                ContentResolution::Missing(hash.to_string())
            }
        }
    }
}
