//! ============================================================================
//! Grant Store - Per-user access windows with lazy expiry
//! ============================================================================
//! Grants are never cached; every check re-reads the store. An expired grant
//! is treated as absent and removed on read, conditionally, so a fresh grant
//! written in between is never clobbered.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::TimeRemaining;
use crate::clock::Clock;
use crate::db::{AccessGrant, PassBackend};
use crate::error::StoreError;

pub struct GrantStore {
    backend: Arc<dyn PassBackend>,
    clock: Arc<dyn Clock>,
}

impl GrantStore {
    pub fn new(backend: Arc<dyn PassBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Overwrite the user's grant with a fresh window starting now
    pub fn grant(&self, owner_id: &str, duration_ms: i64) -> Result<AccessGrant, StoreError> {
        let now = self.clock.now_ms();
        let grant = AccessGrant {
            granted: true,
            granted_at: now,
            expires: now.saturating_add(duration_ms.max(1)),
        };
        self.backend.put_grant(owner_id, &grant)?;
        info!("Access granted to {} until {}", owner_id, grant.expires);
        Ok(grant)
    }

    pub fn is_active(&self, owner_id: &str) -> Result<bool, StoreError> {
        Ok(self.live_grant(owner_id)?.is_some())
    }

    pub fn time_remaining(&self, owner_id: &str) -> Result<TimeRemaining, StoreError> {
        let now = self.clock.now_ms();
        Ok(match self.live_grant(owner_id)? {
            Some(grant) => TimeRemaining::Remaining(grant.expires - now),
            None => TimeRemaining::Unknown,
        })
    }

    /// Read the grant, dropping it if it has expired
    fn live_grant(&self, owner_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        let now = self.clock.now_ms();
        let Some(grant) = self.backend.get_grant(owner_id)? else {
            return Ok(None);
        };
        if grant.is_live(now) {
            return Ok(Some(grant));
        }

        // Best-effort cleanup; the read already answered "absent"
        match self.backend.remove_grant_if_expired(owner_id, now) {
            Ok(true) => debug!("Removed expired grant for {}", owner_id),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove expired grant for {}: {}", owner_id, e),
        }
        Ok(None)
    }
}
