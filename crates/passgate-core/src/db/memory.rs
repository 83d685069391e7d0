//! In-process backend used by tests and by embedders that do not need
//! durability. All state sits under one mutex, so each trait method is atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::types::{
    AccessGrant, Activation, AlbumKey, BroadcastRecord, IngestResult, MediaAlbum, MediaItem,
    TokenRecord, UserProfile,
};
use super::PassBackend;
use crate::config::ConfigOverrides;
use crate::error::StoreError;

#[derive(Default)]
struct MemoryState {
    grants: HashMap<String, AccessGrant>,
    tokens: HashMap<String, TokenRecord>,
    albums: HashMap<String, MediaAlbum>,
    album_groups: HashMap<String, String>,
    views: HashMap<String, u64>,
    users: HashMap<String, UserProfile>,
    broadcasts: Vec<BroadcastRecord>,
    config: Option<ConfigOverrides>,
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored broadcast history, oldest first
    pub fn broadcasts(&self) -> Result<Vec<BroadcastRecord>, StoreError> {
        Ok(self.lock()?.broadcasts.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl PassBackend for MemoryDb {
    fn get_grant(&self, user_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        Ok(self.lock()?.grants.get(user_id).cloned())
    }

    fn put_grant(&self, user_id: &str, grant: &AccessGrant) -> Result<(), StoreError> {
        self.lock()?.grants.insert(user_id.to_string(), grant.clone());
        Ok(())
    }

    fn remove_grant_if_expired(&self, user_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.grants.get(user_id) {
            Some(grant) if !grant.is_live(now_ms) => {
                state.grants.remove(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_grants(&self) -> Result<Vec<(String, AccessGrant)>, StoreError> {
        let state = self.lock()?;
        let mut grants: Vec<_> = state
            .grants
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        grants.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(grants)
    }

    fn insert_token(&self, token: &str, record: &TokenRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.tokens.contains_key(token) {
            return Err(StoreError::Conflict(format!("token already recorded: {}", token)));
        }
        state.tokens.insert(token.to_string(), record.clone());
        Ok(())
    }

    fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.lock()?.tokens.get(token).cloned())
    }

    fn activate_token(&self, token: &str, now_ms: i64) -> Result<Activation, StoreError> {
        let mut state = self.lock()?;
        let Some(record) = state.tokens.get_mut(token) else {
            return Ok(Activation::Missing);
        };
        if record.used {
            return Ok(Activation::AlreadyUsed);
        }
        record.used = true;
        record.activated_at = Some(now_ms);
        Ok(Activation::Activated(record.clone()))
    }

    fn list_tokens(&self) -> Result<Vec<(String, TokenRecord)>, StoreError> {
        let state = self.lock()?;
        let mut tokens: Vec<_> = state
            .tokens
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        tokens.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(tokens)
    }

    fn remove_token(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.tokens.remove(token).is_some())
    }

    fn ingest_media(
        &self,
        group_key: Option<&str>,
        candidate_hash: &str,
        item: &MediaItem,
        now_ms: i64,
    ) -> Result<IngestResult, StoreError> {
        let mut state = self.lock()?;
        let state = &mut *state;

        if let Some(group) = group_key {
            if let Some(hash) = state.album_groups.get(group) {
                let album = state.albums.get_mut(hash).ok_or_else(|| {
                    StoreError::Unavailable(format!("group {} points at missing album {}", group, hash))
                })?;
                album.media.push(item.clone());
                return Ok(IngestResult::Appended(album.clone()));
            }
        }

        if state.albums.contains_key(candidate_hash) {
            return Ok(IngestResult::HashCollision);
        }

        let album = MediaAlbum {
            group_id: group_key.map(str::to_string),
            hash: candidate_hash.to_string(),
            media: vec![item.clone()],
            link_sent: false,
            created_at: now_ms,
        };
        state.albums.insert(candidate_hash.to_string(), album.clone());
        if let Some(group) = group_key {
            state
                .album_groups
                .insert(group.to_string(), candidate_hash.to_string());
        }
        Ok(IngestResult::Created(album))
    }

    fn get_album(&self, hash: &str) -> Result<Option<MediaAlbum>, StoreError> {
        Ok(self.lock()?.albums.get(hash).cloned())
    }

    fn get_album_by_group(&self, group_key: &str) -> Result<Option<MediaAlbum>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .album_groups
            .get(group_key)
            .and_then(|hash| state.albums.get(hash))
            .cloned())
    }

    fn list_albums(&self) -> Result<Vec<MediaAlbum>, StoreError> {
        let state = self.lock()?;
        let mut albums: Vec<_> = state.albums.values().cloned().collect();
        albums.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(albums)
    }

    fn mark_announced(&self, key: AlbumKey<'_>) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let hash = match key {
            AlbumKey::Hash(hash) => hash.to_string(),
            AlbumKey::Group(group) => match state.album_groups.get(group) {
                Some(hash) => hash.clone(),
                None => return Ok(false),
            },
        };
        match state.albums.get_mut(&hash) {
            Some(album) if !album.link_sent => {
                album.link_sent = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn increment_views(&self, hash: &str) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let count = state.views.entry(hash.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn list_views(&self) -> Result<HashMap<String, u64>, StoreError> {
        Ok(self.lock()?.views.clone())
    }

    fn touch_user(&self, profile: &UserProfile, now_ms: i64) -> Result<UserProfile, StoreError> {
        let mut state = self.lock()?;
        let first_seen = state
            .users
            .get(&profile.user_id)
            .map(|u| u.first_seen)
            .unwrap_or(now_ms);
        let mut updated = profile.clone();
        updated.first_seen = first_seen;
        updated.last_seen = now_ms;
        state.users.insert(profile.user_id.clone(), updated.clone());
        Ok(updated)
    }

    fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        let state = self.lock()?;
        let mut users: Vec<_> = state.users.values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(users)
    }

    fn put_broadcast(&self, record: &BroadcastRecord) -> Result<(), StoreError> {
        self.lock()?.broadcasts.push(record.clone());
        Ok(())
    }

    fn get_config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError> {
        Ok(self.lock()?.config.clone())
    }

    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError> {
        self.lock()?.config = Some(overrides.clone());
        Ok(())
    }
}
