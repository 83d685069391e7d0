//! ============================================================================
//! User Directory - Known users, activity stats and broadcasts
//! ============================================================================
//! Broadcasts are best effort: each recipient is tried once, outcomes are
//! recorded, and nothing is retried.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{Clock, HOUR_MS};
use crate::config::ConfigHandle;
use crate::db::{BroadcastRecord, PassBackend, RecipientOutcome, UserProfile};
use crate::error::StoreError;
use crate::media::delivery::{Payload, Sink};

pub struct UserDirectory {
    backend: Arc<dyn PassBackend>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl UserDirectory {
    pub fn new(backend: Arc<dyn PassBackend>, clock: Arc<dyn Clock>, config: ConfigHandle) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    /// Record that the user was seen now; keeps the original `first_seen`
    pub fn track(&self, profile: &UserProfile) -> Result<UserProfile, StoreError> {
        self.backend.touch_user(profile, self.clock.now_ms())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.backend.list_users()?.len())
    }

    /// Users seen within the last `days` days
    pub fn active_count(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = self.clock.now_ms() - i64::from(days) * 24 * HOUR_MS;
        Ok(self
            .backend
            .list_users()?
            .iter()
            .filter(|u| u.last_seen >= cutoff)
            .count())
    }

    /// Send `text` to every known user, pacing sends, and store the outcome
    pub async fn broadcast(&self, sink: &dyn Sink, text: &str) -> Result<BroadcastRecord, StoreError> {
        let users = self.backend.list_users()?;
        let pacing = Duration::from_millis(self.config.snapshot().config.broadcast_pacing_ms);

        let mut record = BroadcastRecord {
            broadcast_id: uuid::Uuid::new_v4().to_string(),
            message: text.to_string(),
            sent_at: self.clock.now_ms(),
            completed_at: None,
            total_users: users.len(),
            success: 0,
            failed: 0,
            recipients: Vec::with_capacity(users.len()),
        };
        info!("Broadcast {} starting to {} users", record.broadcast_id, users.len());

        for (i, user) in users.iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            let outcome = match sink.emit(&user.user_id, Payload::Text(text.to_string())).await {
                Ok(_) => {
                    record.success += 1;
                    RecipientOutcome {
                        user_id: user.user_id.clone(),
                        sent: true,
                        error: None,
                        timestamp: self.clock.now_ms(),
                    }
                }
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", user.user_id, e);
                    record.failed += 1;
                    RecipientOutcome {
                        user_id: user.user_id.clone(),
                        sent: false,
                        error: Some(e.to_string()),
                        timestamp: self.clock.now_ms(),
                    }
                }
            };
            record.recipients.push(outcome);
        }

        record.completed_at = Some(self.clock.now_ms());
        self.backend.put_broadcast(&record)?;
        info!(
            "Broadcast {} done: {} sent, {} failed",
            record.broadcast_id, record.success, record.failed
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GateConfig;
    use crate::db::MemoryDb;
    use crate::testing::RecordingSink;

    const T0: i64 = 1_700_000_000_000;

    fn directory() -> (Arc<ManualClock>, Arc<MemoryDb>, UserDirectory) {
        let clock = Arc::new(ManualClock::new(T0));
        let db = Arc::new(MemoryDb::new());
        let dir = UserDirectory::new(db.clone(), clock.clone(), ConfigHandle::new(GateConfig::default()));
        (clock, db, dir)
    }

    #[test]
    fn test_track_keeps_first_seen() {
        let (clock, _db, dir) = directory();
        dir.track(&UserProfile::new("1").with_username("alice")).unwrap();
        clock.advance(HOUR_MS);
        let again = dir.track(&UserProfile::new("1").with_first_name("Alice")).unwrap();
        assert_eq!(again.first_seen, T0);
        assert_eq!(again.last_seen, T0 + HOUR_MS);
        assert_eq!(again.first_name.as_deref(), Some("Alice"));
        assert_eq!(dir.count().unwrap(), 1);
    }

    #[test]
    fn test_active_count() {
        let (clock, _db, dir) = directory();
        dir.track(&UserProfile::new("old")).unwrap();
        clock.advance(31 * 24 * HOUR_MS);
        dir.track(&UserProfile::new("new")).unwrap();
        assert_eq!(dir.count().unwrap(), 2);
        assert_eq!(dir.active_count(30).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_records_outcomes() {
        let (_clock, db, dir) = directory();
        for id in ["1", "2", "3"] {
            dir.track(&UserProfile::new(id)).unwrap();
        }
        let sink = RecordingSink::new().fail_emit_to("2");

        let started = tokio::time::Instant::now();
        let record = dir.broadcast(&sink, "maintenance tonight").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert_eq!(record.total_users, 3);
        assert_eq!(record.success, 2);
        assert_eq!(record.failed, 1);
        let failed: Vec<_> = record.recipients.iter().filter(|r| !r.sent).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].user_id, "2");
        assert!(record.completed_at.is_some());

        assert_eq!(sink.texts("1"), vec!["maintenance tonight".to_string()]);
        assert_eq!(db.broadcasts().unwrap().len(), 1);
    }
}
