//! ============================================================================
//! Media Registry - Hash-addressed albums
//! ============================================================================
//! Albums are assembled from upload parts sharing a group key. The store does
//! the append-or-create atomically; this layer picks hashes and keeps a
//! read-mostly working copy, refreshed by every mutation made through it.
//! ============================================================================

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::{AlbumKey, IngestResult, MediaAlbum, MediaItem, MediaKind, PassBackend};
use crate::error::StoreError;

/// Length of a generated album hash
pub const HASH_LEN: usize = 10;

const HASH_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Fresh hashes tried before giving up on an ingest
const MAX_HASH_ATTEMPTS: usize = 8;

/// Generate an opaque lowercase base36 album hash
pub fn generate_hash() -> String {
    let mut rng = rand::thread_rng();
    (0..HASH_LEN)
        .map(|_| HASH_ALPHABET[rng.gen_range(0..HASH_ALPHABET.len())] as char)
        .collect()
}

/// What an ingest did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub hash: String,
    /// True when this part started a new album
    pub created: bool,
    pub media_count: usize,
}

pub struct MediaRegistry {
    backend: Arc<dyn PassBackend>,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<String, MediaAlbum>>,
}

impl MediaRegistry {
    pub fn new(backend: Arc<dyn PassBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Add one upload part. Parts with the same group key land in one album;
    /// a part without a group key always starts a new album.
    pub async fn ingest(
        &self,
        group_key: Option<&str>,
        kind: MediaKind,
        file_ref: &str,
    ) -> Result<IngestReceipt, StoreError> {
        self.ingest_with(group_key, kind, file_ref, generate_hash).await
    }

    async fn ingest_with(
        &self,
        group_key: Option<&str>,
        kind: MediaKind,
        file_ref: &str,
        mut next_hash: impl FnMut() -> String,
    ) -> Result<IngestReceipt, StoreError> {
        let item = MediaItem {
            kind,
            file_ref: file_ref.to_string(),
        };

        for _ in 0..MAX_HASH_ATTEMPTS {
            let candidate = next_hash();
            let result =
                self.backend
                    .ingest_media(group_key, &candidate, &item, self.clock.now_ms())?;
            let (album, created) = match result {
                IngestResult::Created(album) => (album, true),
                IngestResult::Appended(album) => (album, false),
                IngestResult::HashCollision => {
                    warn!("Album hash collision on {}, retrying", candidate);
                    continue;
                }
            };

            if created {
                info!("New album {} ({})", album.hash, kind.as_str());
            } else {
                debug!("Appended {} to album {} ({} items)", kind.as_str(), album.hash, album.media.len());
            }
            let receipt = IngestReceipt {
                hash: album.hash.clone(),
                created,
                media_count: album.media.len(),
            };
            self.refresh(album).await;
            return Ok(receipt);
        }

        Err(StoreError::Conflict(format!(
            "no free album hash after {} attempts",
            MAX_HASH_ATTEMPTS
        )))
    }

    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<MediaAlbum>, StoreError> {
        if let Some(album) = self.cache.read().await.get(hash) {
            return Ok(Some(album.clone()));
        }
        let album = self.backend.get_album(hash)?;
        if let Some(album) = &album {
            self.refresh(album.clone()).await;
        }
        Ok(album)
    }

    /// Flip the announcement flag; true only for the call that flipped it
    pub async fn mark_announced(&self, key: AlbumKey<'_>) -> Result<bool, StoreError> {
        let flipped = self.backend.mark_announced(key)?;
        if flipped {
            let album = match key {
                AlbumKey::Hash(hash) => self.backend.get_album(hash)?,
                AlbumKey::Group(group) => self.backend.get_album_by_group(group)?,
            };
            if let Some(album) = album {
                self.refresh(album).await;
            }
        }
        Ok(flipped)
    }

    /// Albums only grow, so never replace a cached copy with a shorter one
    /// written by a slower concurrent ingest
    async fn refresh(&self, album: MediaAlbum) {
        let mut cache = self.cache.write().await;
        let stale = cache
            .get(&album.hash)
            .map_or(true, |cached| cached.media.len() <= album.media.len());
        if stale {
            cache.insert(album.hash.clone(), album);
        }
    }

    /// Count one serve of the album; returns the new total
    pub fn track_view(&self, hash: &str) -> Result<u64, StoreError> {
        self.backend.increment_views(hash)
    }
}
