//! ============================================================================
//! Delivery Scheduler - Self-destructing media delivery
//! ============================================================================
//! Each emitted item gets its own retraction task, keyed by
//! (destination, message). After the delay the task retracts the message and
//! sends one "content cleaned" notice with the grant's remaining time.
//!
//! Retractions live in memory only: a restart drops every pending one and
//! those messages stay up. Known limitation.
//! ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::grants::GrantStore;
use crate::access::types::TimeRemaining;
use crate::config::ConfigHandle;
use crate::db::{MediaAlbum, MediaKind};
use crate::error::SinkError;

/// Transport-side handle to an emitted message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef(pub String);

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Media {
        kind: MediaKind,
        file_ref: String,
        caption: String,
    },
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractOutcome {
    Retracted,
    /// Already gone (user deleted it, or the chat is closed)
    NotFound,
}

/// Transport layer collaborator
#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit(&self, destination: &str, payload: Payload) -> Result<MessageRef, SinkError>;
    async fn retract(
        &self,
        destination: &str,
        message: &MessageRef,
    ) -> Result<RetractOutcome, SinkError>;
}

/// Summary of one `deliver` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<MessageRef>,
    pub failed: usize,
}

type RetractionKey = (String, MessageRef);
type PendingMap = Arc<Mutex<HashMap<RetractionKey, JoinHandle<()>>>>;

pub struct DeliveryScheduler {
    sink: Arc<dyn Sink>,
    grants: Arc<GrantStore>,
    config: ConfigHandle,
    pending: PendingMap,
}

impl DeliveryScheduler {
    pub fn new(sink: Arc<dyn Sink>, grants: Arc<GrantStore>, config: ConfigHandle) -> Self {
        Self {
            sink,
            grants,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emit every item of `album` to `destination` and schedule one retraction
    /// per emitted item. A failed item is logged and skipped.
    pub async fn deliver(
        &self,
        destination: &str,
        album: &MediaAlbum,
        display_name: &str,
    ) -> DeliveryReport {
        let delay = self.config.snapshot().config.retraction_delay();
        let minutes = delay.as_secs() / 60;
        let mut report = DeliveryReport::default();

        for (index, item) in album.media.iter().enumerate() {
            let payload = Payload::Media {
                kind: item.kind,
                file_ref: item.file_ref.clone(),
                caption: format!(
                    "Here you go, {}! ({}/{})\nThis will be deleted in {} minutes. Save it now.",
                    display_name,
                    index + 1,
                    album.media.len(),
                    minutes
                ),
            };

            match self.sink.emit(destination, payload).await {
                Ok(message) => {
                    self.schedule_retraction(destination, message.clone(), delay);
                    report.delivered.push(message);
                }
                Err(e) => {
                    warn!(
                        "Failed to deliver item {} of album {} to {}: {}",
                        index + 1,
                        album.hash,
                        destination,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            "Delivered album {} to {}: {} sent, {} failed",
            album.hash,
            destination,
            report.delivered.len(),
            report.failed
        );
        report
    }

    fn schedule_retraction(&self, destination: &str, message: MessageRef, delay: std::time::Duration) {
        let key = (destination.to_string(), message.clone());
        let sink = self.sink.clone();
        let grants = self.grants.clone();
        let pending = self.pending.clone();
        let destination = destination.to_string();

        // Hold the lock across spawn so the task's own removal cannot run
        // before its handle is inserted
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            retract_and_notify(sink.as_ref(), &grants, &destination, &message).await;
            pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_key);
        });
        if let Some(previous) = map.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel a pending retraction; true if one was pending
    pub fn cancel(&self, destination: &str, message: &MessageRef) -> bool {
        let key = (destination.to_string(), message.clone());
        let handle = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        match handle {
            Some(handle) => {
                handle.abort();
                debug!("Cancelled retraction of {} in {}", message, destination);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn retract_and_notify(
    sink: &dyn Sink,
    grants: &GrantStore,
    destination: &str,
    message: &MessageRef,
) {
    match sink.retract(destination, message).await {
        Ok(RetractOutcome::Retracted) => debug!("Retracted {} in {}", message, destination),
        Ok(RetractOutcome::NotFound) => debug!("Message {} in {} already gone", message, destination),
        Err(e) => {
            warn!("Failed to retract {} in {}: {}", message, destination, e);
            return;
        }
    }

    let remaining = grants.time_remaining(destination).unwrap_or_else(|e| {
        warn!("Could not read grant for {}: {}", destination, e);
        TimeRemaining::Unknown
    });
    let notice = format!(
        "Content cleaned. Request it again any time while your pass is active.\nTime left: {}",
        remaining
    );
    if let Err(e) = sink.emit(destination, Payload::Text(notice)).await {
        warn!("Failed to send cleanup notice to {}: {}", destination, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, HOUR_MS, MINUTE_MS};
    use crate::config::GateConfig;
    use crate::db::{MediaItem, MemoryDb};
    use crate::testing::RecordingSink;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn album(n: usize) -> MediaAlbum {
        MediaAlbum {
            group_id: Some("g1".into()),
            hash: "abc123".into(),
            media: (0..n)
                .map(|i| MediaItem {
                    kind: MediaKind::Photo,
                    file_ref: format!("f{}", i),
                })
                .collect(),
            link_sent: true,
            created_at: 0,
        }
    }

    fn scheduler(sink: Arc<RecordingSink>) -> (Arc<ManualClock>, Arc<GrantStore>, DeliveryScheduler) {
        let clock = Arc::new(ManualClock::new(T0));
        let grants = Arc::new(GrantStore::new(Arc::new(MemoryDb::new()), clock.clone()));
        let scheduler =
            DeliveryScheduler::new(sink, grants.clone(), ConfigHandle::new(GateConfig::default()));
        (clock, grants, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_retraction_per_item() {
        let sink = Arc::new(RecordingSink::new());
        let (clock, grants, scheduler) = scheduler(sink.clone());
        grants.grant("42", 18 * HOUR_MS).unwrap();

        let report = scheduler.deliver("42", &album(3), "Alice").await;
        assert_eq!(report.delivered.len(), 3);
        assert_eq!(scheduler.pending_count(), 3);

        // Not yet
        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        assert!(sink.retracted().is_empty());

        clock.advance(15 * MINUTE_MS);
        tokio::time::sleep(Duration::from_secs(61)).await;
        let retracted = sink.retracted();
        assert_eq!(retracted.len(), 3);
        for message in &report.delivered {
            assert_eq!(retracted.iter().filter(|(_, m)| m == message).count(), 1);
        }

        let notices = sink.texts("42");
        assert_eq!(notices.len(), 3);
        assert!(notices.iter().all(|n| n.contains("Time left: 17h 45m")));

        // Nothing fires twice
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(sink.retracted().len(), 3);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_failure_does_not_abort_album() {
        let sink = Arc::new(RecordingSink::new().fail_emit_at(1));
        let (_clock, _grants, scheduler) = scheduler(sink.clone());

        let report = scheduler.deliver("42", &album(3), "Alice").await;
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.failed, 1);
        assert_eq!(scheduler.pending_count(), 2);

        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert_eq!(sink.retracted().len(), 2);
        // No grant: remaining time is unknown
        assert!(sink.texts("42").iter().all(|n| n.contains("Time left: unknown")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_retraction() {
        let sink = Arc::new(RecordingSink::new());
        let (_clock, _grants, scheduler) = scheduler(sink.clone());

        let report = scheduler.deliver("42", &album(2), "Alice").await;
        assert!(scheduler.cancel("42", &report.delivered[0]));
        assert!(!scheduler.cancel("42", &report.delivered[0]));

        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert_eq!(sink.retracted(), vec![("42".to_string(), report.delivered[1].clone())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retract_error_skips_notice() {
        let sink = Arc::new(RecordingSink::new().fail_retract());
        let (_clock, _grants, scheduler) = scheduler(sink.clone());

        scheduler.deliver("42", &album(1), "Alice").await;
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert!(sink.texts("42").is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }
}
