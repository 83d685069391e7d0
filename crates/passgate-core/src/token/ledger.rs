//! Token ledger: issuance records and the single-use flag.

use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::db::{Activation, PassBackend, TokenRecord};
use crate::error::StoreError;

pub struct TokenLedger {
    backend: Arc<dyn PassBackend>,
    clock: Arc<dyn Clock>,
}

impl TokenLedger {
    pub fn new(backend: Arc<dyn PassBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Insert a fresh, unused record for `token`
    pub fn record(
        &self,
        token: &str,
        owner_id: &str,
        media_hash: Option<&str>,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let record = TokenRecord {
            owner_id: owner_id.to_string(),
            media_hash: media_hash.filter(|h| !h.is_empty()).map(str::to_string),
            expires_at,
            created_at: self.clock.now_ms(),
            used: false,
            activated_at: None,
        };
        self.backend.insert_token(token, &record)?;
        debug!("Token recorded for owner {} (expires {})", owner_id, expires_at);
        Ok(())
    }

    /// Flip `used` to true. Exactly one concurrent caller per token gets `true`;
    /// a missing or already used record is `false`, not an error.
    pub fn activate(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.activate_record(token)?.is_some())
    }

    /// Same as [`activate`](Self::activate) but hands back the updated record
    pub fn activate_record(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        match self.backend.activate_token(token, self.clock.now_ms())? {
            Activation::Activated(record) => {
                info!("Token activated for owner {}", record.owner_id);
                Ok(Some(record))
            }
            Activation::AlreadyUsed => {
                debug!("Token already used");
                Ok(None)
            }
            Activation::Missing => {
                debug!("Token not found in ledger");
                Ok(None)
            }
        }
    }

    pub fn lookup(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        self.backend.get_token(token)
    }
}
