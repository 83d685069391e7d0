//! ============================================================================
//! Database Types - Serializable records for the pass store
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-user access window.
/// Logically dead once `now > expires`, whether or not it has been removed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub granted: bool,
    pub granted_at: i64,
    pub expires: i64,
}

impl AccessGrant {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.granted && now_ms <= self.expires
    }
}

/// Issuance record for a minted token, keyed by the token string.
/// Kept after use for replay detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub owner_id: String,
    /// Album the token should unlock on activation (None = general access)
    pub media_hash: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
    pub used: bool,
    pub activated_at: Option<i64>,
}

/// Result of the atomic used-flag flip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// This call flipped `used` from false to true
    Activated(TokenRecord),
    /// Another call got there first
    AlreadyUsed,
    /// No record for this token
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// Transport-side file reference
    pub file_ref: String,
}

/// Hash-addressed group of media delivered together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAlbum {
    /// Upload group key (None for single items)
    pub group_id: Option<String>,
    /// Public address of the album; never reassigned
    pub hash: String,
    pub media: Vec<MediaItem>,
    /// Whether the "new album" announcement has gone out
    pub link_sent: bool,
    pub created_at: i64,
}

/// How to address an album for the announcement flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumKey<'a> {
    Hash(&'a str),
    Group(&'a str),
}

/// Outcome of the atomic append-or-create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestResult {
    Created(MediaAlbum),
    Appended(MediaAlbum),
    /// The candidate hash is already taken; retry with a fresh one
    HashCollision,
}

/// Known user, tracked for broadcasts and stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_bot: bool,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
            first_name: None,
            last_name: None,
            language_code: None,
            is_bot: false,
            first_seen: 0,
            last_seen: 0,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_first_name(mut self, first_name: impl Into<String>) -> Self {
        self.first_name = Some(first_name.into());
        self
    }
}

/// Per-recipient broadcast outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub user_id: String,
    pub sent: bool,
    pub error: Option<String>,
    pub timestamp: i64,
}

/// History entry for one broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub broadcast_id: String,
    pub message: String,
    pub sent_at: i64,
    pub completed_at: Option<i64>,
    pub total_users: usize,
    pub success: usize,
    pub failed: usize,
    pub recipients: Vec<RecipientOutcome>,
}

/// Summary counts across collections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_grants: usize,
    pub live_grants: usize,
    pub total_tokens: usize,
    pub used_tokens: usize,
    pub total_albums: usize,
    pub total_media: usize,
    pub total_users: usize,
    pub album_views: HashMap<String, u64>,
}
