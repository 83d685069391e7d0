// ============================================================================
// PassDb - Embedded Database (redb)
// ============================================================================
// Persistent storage for grants, tokens, albums, users and config overrides.
// Default path: ~/.passgate/passgate.redb (override via PASSGATE_DB_PATH)
//
// Every check-then-act on shared state (token activation, lazy grant expiry,
// album append, announcement flag, view counter) runs inside one write
// transaction. redb admits a single writer at a time, so these are atomic.
// ============================================================================

mod memory;
pub mod types;

pub use memory::MemoryDb;
pub use types::{
    AccessGrant, Activation, AlbumKey, BroadcastRecord, DbStats, IngestResult, MediaAlbum,
    MediaItem, MediaKind, RecipientOutcome, TokenRecord, UserProfile,
};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::ConfigOverrides;
use crate::error::StoreError;

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Table definitions
const GRANTS: RecordTable = TableDefinition::new("grants");
const TOKENS: RecordTable = TableDefinition::new("tokens");
const ALBUMS: RecordTable = TableDefinition::new("albums");
const USERS: RecordTable = TableDefinition::new("users");
const BROADCASTS: RecordTable = TableDefinition::new("broadcasts");
const CONFIG: RecordTable = TableDefinition::new("config");
const ALBUM_GROUPS: TableDefinition<&str, &str> = TableDefinition::new("album_groups");
const VIEWS: TableDefinition<&str, u64> = TableDefinition::new("views");

const CONFIG_KEY: &str = "config:overrides";

/// Keyed store behind the grant store, token ledger and media registry.
///
/// Methods documented as atomic must perform their read and write in a single
/// transaction (or under a single lock); callers rely on that for the
/// single-use and exactly-once guarantees.
pub trait PassBackend: Send + Sync {
    // Grants
    fn get_grant(&self, user_id: &str) -> Result<Option<AccessGrant>, StoreError>;
    fn put_grant(&self, user_id: &str, grant: &AccessGrant) -> Result<(), StoreError>;
    /// Atomic: remove the grant only if it is still expired at `now_ms`
    fn remove_grant_if_expired(&self, user_id: &str, now_ms: i64) -> Result<bool, StoreError>;
    fn list_grants(&self) -> Result<Vec<(String, AccessGrant)>, StoreError>;

    // Tokens
    /// Insert a new record; `Conflict` if the token string is already recorded
    fn insert_token(&self, token: &str, record: &TokenRecord) -> Result<(), StoreError>;
    fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError>;
    /// Atomic compare-and-set of `used` from false to true
    fn activate_token(&self, token: &str, now_ms: i64) -> Result<Activation, StoreError>;
    fn list_tokens(&self) -> Result<Vec<(String, TokenRecord)>, StoreError>;
    fn remove_token(&self, token: &str) -> Result<bool, StoreError>;

    // Albums
    /// Atomic: append to the album for `group_key`, or create one under
    /// `candidate_hash` if the group is new (or there is no group)
    fn ingest_media(
        &self,
        group_key: Option<&str>,
        candidate_hash: &str,
        item: &MediaItem,
        now_ms: i64,
    ) -> Result<IngestResult, StoreError>;
    fn get_album(&self, hash: &str) -> Result<Option<MediaAlbum>, StoreError>;
    fn get_album_by_group(&self, group_key: &str) -> Result<Option<MediaAlbum>, StoreError>;
    fn list_albums(&self) -> Result<Vec<MediaAlbum>, StoreError>;
    /// Atomic: flip `link_sent` false -> true; returns whether this call flipped it
    fn mark_announced(&self, key: AlbumKey<'_>) -> Result<bool, StoreError>;
    /// Atomic increment; returns the new count
    fn increment_views(&self, hash: &str) -> Result<u64, StoreError>;
    fn list_views(&self) -> Result<HashMap<String, u64>, StoreError>;

    // Users
    /// Atomic upsert that keeps the stored `first_seen` and sets `last_seen`
    fn touch_user(&self, profile: &UserProfile, now_ms: i64) -> Result<UserProfile, StoreError>;
    fn list_users(&self) -> Result<Vec<UserProfile>, StoreError>;
    fn put_broadcast(&self, record: &BroadcastRecord) -> Result<(), StoreError>;

    // Config
    fn get_config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError>;
    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError>;

    fn stats(&self, now_ms: i64) -> Result<DbStats, StoreError> {
        let grants = self.list_grants()?;
        let tokens = self.list_tokens()?;
        let albums = self.list_albums()?;
        Ok(DbStats {
            total_grants: grants.len(),
            live_grants: grants.iter().filter(|(_, g)| g.is_live(now_ms)).count(),
            total_tokens: tokens.len(),
            used_tokens: tokens.iter().filter(|(_, t)| t.used).count(),
            total_albums: albums.len(),
            total_media: albums.iter().map(|a| a.media.len()).sum(),
            total_users: self.list_users()?.len(),
            album_views: self.list_views()?,
        })
    }
}

/// redb-backed pass store
pub struct PassDb {
    db: Database,
    path: PathBuf,
}

impl PassDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses PASSGATE_DB_PATH env var or ~/.passgate/passgate.redb
    pub fn open(path: Option<&str>) -> Result<Self, StoreError> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("PASSGATE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir()
                .ok_or_else(|| StoreError::Unavailable("Cannot determine home directory".into()))?;
            let dir = home.join(".passgate");
            std::fs::create_dir_all(&dir)
                .map_err(|e| StoreError::backend("Failed to create .passgate directory", e))?;
            dir.join("passgate.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| StoreError::backend("Failed to open database", e))?;
        let store = Self { db, path: db_path };

        // Ensure tables exist so read transactions never hit a missing table
        store.write(|txn| {
            for table in [GRANTS, TOKENS, ALBUMS, USERS, BROADCASTS, CONFIG] {
                txn.open_table(table)
                    .map_err(|e| StoreError::backend("Failed to create table", e))?;
            }
            txn.open_table(ALBUM_GROUPS)
                .map_err(|e| StoreError::backend("Failed to create album_groups table", e))?;
            txn.open_table(VIEWS)
                .map_err(|e| StoreError::backend("Failed to create views table", e))?;
            Ok(())
        })?;

        info!("Database ready");
        Ok(store)
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove grants that expired before `now_ms`; returns how many went
    pub fn prune_expired_grants(&self, now_ms: i64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (user_id, grant) in self.list_grants()? {
            if !grant.is_live(now_ms) && self.remove_grant_if_expired(&user_id, now_ms)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Pruned {} expired grants", removed);
        }
        Ok(removed)
    }

    /// Remove token records whose expiry is older than `cutoff_ms`.
    /// Records younger than that are kept for replay detection.
    pub fn prune_tokens_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (token, record) in self.list_tokens()? {
            if record.expires_at < cutoff_ms && self.remove_token(&token)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Pruned {} token records", removed);
        }
        Ok(removed)
    }

    // ========================================================================
    // Transaction helpers
    // ========================================================================

    fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::backend("Failed to begin write", e))?;
        let out = f(&txn)?;
        txn.commit()
            .map_err(|e| StoreError::backend("Failed to commit", e))?;
        Ok(out)
    }

    fn read_record<T: DeserializeOwned>(
        &self,
        table: RecordTable,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::backend("Failed to begin read", e))?;
        let table = txn
            .open_table(table)
            .map_err(|e| StoreError::backend("Failed to open table", e))?;
        let record = match table
            .get(key)
            .map_err(|e| StoreError::backend("Failed to get record", e))?
        {
            Some(value) => Some(bincode::deserialize(value.value())?),
            None => None,
        };
        Ok(record)
    }

    fn put_record<T: Serialize>(
        &self,
        table: RecordTable,
        key: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let value = bincode::serialize(record)?;
        self.write(|txn| {
            let mut table = txn
                .open_table(table)
                .map_err(|e| StoreError::backend("Failed to open table", e))?;
            table
                .insert(key, value.as_slice())
                .map_err(|e| StoreError::backend("Failed to insert record", e))?;
            Ok(())
        })
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        table: RecordTable,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::backend("Failed to begin read", e))?;
        let table = txn
            .open_table(table)
            .map_err(|e| StoreError::backend("Failed to open table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| StoreError::backend("Failed to iterate", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::backend("Failed to read entry", e))?;
            let record: T = bincode::deserialize(value.value())?;
            results.push((key.value().to_string(), record));
        }
        Ok(results)
    }

    fn remove_record(&self, table: RecordTable, key: &str) -> Result<bool, StoreError> {
        self.write(|txn| {
            let mut table = txn
                .open_table(table)
                .map_err(|e| StoreError::backend("Failed to open table", e))?;
            let removed = table
                .remove(key)
                .map_err(|e| StoreError::backend("Failed to remove record", e))?
                .is_some();
            Ok(removed)
        })
    }
}

/// Read and decode one record inside an open write transaction
fn get_in_txn<T: DeserializeOwned>(
    table: &redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let record = match table
        .get(key)
        .map_err(|e| StoreError::backend("Failed to get record", e))?
    {
        Some(value) => Some(bincode::deserialize(value.value())?),
        None => None,
    };
    Ok(record)
}

impl PassBackend for PassDb {
    // ========================================================================
    // Grant Operations
    // ========================================================================

    fn get_grant(&self, user_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        self.read_record(GRANTS, user_id)
    }

    fn put_grant(&self, user_id: &str, grant: &AccessGrant) -> Result<(), StoreError> {
        self.put_record(GRANTS, user_id, grant)?;
        debug!("Stored grant for user {} (expires {})", user_id, grant.expires);
        Ok(())
    }

    fn remove_grant_if_expired(&self, user_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        self.write(|txn| {
            let mut table = txn
                .open_table(GRANTS)
                .map_err(|e| StoreError::backend("Failed to open grants table", e))?;
            let current: Option<AccessGrant> = get_in_txn(&table, user_id)?;
            match current {
                Some(grant) if !grant.is_live(now_ms) => {
                    table
                        .remove(user_id)
                        .map_err(|e| StoreError::backend("Failed to remove grant", e))?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn list_grants(&self) -> Result<Vec<(String, AccessGrant)>, StoreError> {
        self.list_records(GRANTS)
    }

    // ========================================================================
    // Token Operations
    // ========================================================================

    fn insert_token(&self, token: &str, record: &TokenRecord) -> Result<(), StoreError> {
        let value = bincode::serialize(record)?;
        self.write(|txn| {
            let mut table = txn
                .open_table(TOKENS)
                .map_err(|e| StoreError::backend("Failed to open tokens table", e))?;
            let exists = table
                .get(token)
                .map_err(|e| StoreError::backend("Failed to get token", e))?
                .is_some();
            if exists {
                return Err(StoreError::Conflict(format!("token already recorded: {}", token)));
            }
            table
                .insert(token, value.as_slice())
                .map_err(|e| StoreError::backend("Failed to insert token", e))?;
            Ok(())
        })?;
        debug!("Recorded token for owner {}", record.owner_id);
        Ok(())
    }

    fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        self.read_record(TOKENS, token)
    }

    fn activate_token(&self, token: &str, now_ms: i64) -> Result<Activation, StoreError> {
        self.write(|txn| {
            let mut table = txn
                .open_table(TOKENS)
                .map_err(|e| StoreError::backend("Failed to open tokens table", e))?;
            let current: Option<TokenRecord> = get_in_txn(&table, token)?;
            let mut record = match current {
                None => return Ok(Activation::Missing),
                Some(r) if r.used => return Ok(Activation::AlreadyUsed),
                Some(r) => r,
            };
            record.used = true;
            record.activated_at = Some(now_ms);
            let value = bincode::serialize(&record)?;
            table
                .insert(token, value.as_slice())
                .map_err(|e| StoreError::backend("Failed to update token", e))?;
            Ok(Activation::Activated(record))
        })
    }

    fn list_tokens(&self) -> Result<Vec<(String, TokenRecord)>, StoreError> {
        self.list_records(TOKENS)
    }

    fn remove_token(&self, token: &str) -> Result<bool, StoreError> {
        self.remove_record(TOKENS, token)
    }

    // ========================================================================
    // Album Operations
    // ========================================================================

    fn ingest_media(
        &self,
        group_key: Option<&str>,
        candidate_hash: &str,
        item: &MediaItem,
        now_ms: i64,
    ) -> Result<IngestResult, StoreError> {
        self.write(|txn| {
            let mut albums = txn
                .open_table(ALBUMS)
                .map_err(|e| StoreError::backend("Failed to open albums table", e))?;
            let mut groups = txn
                .open_table(ALBUM_GROUPS)
                .map_err(|e| StoreError::backend("Failed to open album_groups table", e))?;

            if let Some(group) = group_key {
                let existing_hash = groups
                    .get(group)
                    .map_err(|e| StoreError::backend("Failed to get group", e))?
                    .map(|v| v.value().to_string());
                if let Some(hash) = existing_hash {
                    let current: Option<MediaAlbum> = get_in_txn(&albums, &hash)?;
                    let mut album = current.ok_or_else(|| {
                        StoreError::Unavailable(format!("group {} points at missing album {}", group, hash))
                    })?;
                    album.media.push(item.clone());
                    let value = bincode::serialize(&album)?;
                    albums
                        .insert(hash.as_str(), value.as_slice())
                        .map_err(|e| StoreError::backend("Failed to update album", e))?;
                    return Ok(IngestResult::Appended(album));
                }
            }

            let taken = albums
                .get(candidate_hash)
                .map_err(|e| StoreError::backend("Failed to check hash", e))?
                .is_some();
            if taken {
                return Ok(IngestResult::HashCollision);
            }

            let album = MediaAlbum {
                group_id: group_key.map(str::to_string),
                hash: candidate_hash.to_string(),
                media: vec![item.clone()],
                link_sent: false,
                created_at: now_ms,
            };
            let value = bincode::serialize(&album)?;
            albums
                .insert(candidate_hash, value.as_slice())
                .map_err(|e| StoreError::backend("Failed to insert album", e))?;
            if let Some(group) = group_key {
                groups
                    .insert(group, candidate_hash)
                    .map_err(|e| StoreError::backend("Failed to index group", e))?;
            }
            Ok(IngestResult::Created(album))
        })
    }

    fn get_album(&self, hash: &str) -> Result<Option<MediaAlbum>, StoreError> {
        self.read_record(ALBUMS, hash)
    }

    fn get_album_by_group(&self, group_key: &str) -> Result<Option<MediaAlbum>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::backend("Failed to begin read", e))?;
        let groups = txn
            .open_table(ALBUM_GROUPS)
            .map_err(|e| StoreError::backend("Failed to open album_groups table", e))?;
        let hash = groups
            .get(group_key)
            .map_err(|e| StoreError::backend("Failed to get group", e))?
            .map(|v| v.value().to_string());
        match hash {
            Some(hash) => self.get_album(&hash),
            None => Ok(None),
        }
    }

    fn list_albums(&self) -> Result<Vec<MediaAlbum>, StoreError> {
        Ok(self
            .list_records::<MediaAlbum>(ALBUMS)?
            .into_iter()
            .map(|(_, album)| album)
            .collect())
    }

    fn mark_announced(&self, key: AlbumKey<'_>) -> Result<bool, StoreError> {
        self.write(|txn| {
            let mut albums = txn
                .open_table(ALBUMS)
                .map_err(|e| StoreError::backend("Failed to open albums table", e))?;
            let hash = match key {
                AlbumKey::Hash(hash) => hash.to_string(),
                AlbumKey::Group(group) => {
                    let groups = txn
                        .open_table(ALBUM_GROUPS)
                        .map_err(|e| StoreError::backend("Failed to open album_groups table", e))?;
                    let found = groups
                        .get(group)
                        .map_err(|e| StoreError::backend("Failed to get group", e))?
                        .map(|v| v.value().to_string());
                    match found {
                        Some(hash) => hash,
                        None => return Ok(false),
                    }
                }
            };
            let current: Option<MediaAlbum> = get_in_txn(&albums, &hash)?;
            match current {
                Some(mut album) if !album.link_sent => {
                    album.link_sent = true;
                    let value = bincode::serialize(&album)?;
                    albums
                        .insert(hash.as_str(), value.as_slice())
                        .map_err(|e| StoreError::backend("Failed to update album", e))?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn increment_views(&self, hash: &str) -> Result<u64, StoreError> {
        self.write(|txn| {
            let mut table = txn
                .open_table(VIEWS)
                .map_err(|e| StoreError::backend("Failed to open views table", e))?;
            let current = table
                .get(hash)
                .map_err(|e| StoreError::backend("Failed to get views", e))?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = current + 1;
            table
                .insert(hash, next)
                .map_err(|e| StoreError::backend("Failed to update views", e))?;
            Ok(next)
        })
    }

    fn list_views(&self) -> Result<HashMap<String, u64>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::backend("Failed to begin read", e))?;
        let table = txn
            .open_table(VIEWS)
            .map_err(|e| StoreError::backend("Failed to open views table", e))?;
        let mut views = HashMap::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| StoreError::backend("Failed to iterate views", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::backend("Failed to read entry", e))?;
            views.insert(key.value().to_string(), value.value());
        }
        Ok(views)
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    fn touch_user(&self, profile: &UserProfile, now_ms: i64) -> Result<UserProfile, StoreError> {
        self.write(|txn| {
            let mut table = txn
                .open_table(USERS)
                .map_err(|e| StoreError::backend("Failed to open users table", e))?;
            let existing: Option<UserProfile> = get_in_txn(&table, &profile.user_id)?;
            let mut updated = profile.clone();
            updated.first_seen = existing.map(|u| u.first_seen).unwrap_or(now_ms);
            updated.last_seen = now_ms;
            let value = bincode::serialize(&updated)?;
            table
                .insert(profile.user_id.as_str(), value.as_slice())
                .map_err(|e| StoreError::backend("Failed to insert user", e))?;
            Ok(updated)
        })
    }

    fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        Ok(self
            .list_records::<UserProfile>(USERS)?
            .into_iter()
            .map(|(_, user)| user)
            .collect())
    }

    fn put_broadcast(&self, record: &BroadcastRecord) -> Result<(), StoreError> {
        self.put_record(BROADCASTS, &record.broadcast_id, record)?;
        debug!("Stored broadcast {}", record.broadcast_id);
        Ok(())
    }

    // ========================================================================
    // Config Operations
    // ========================================================================

    fn get_config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError> {
        self.read_record(CONFIG, CONFIG_KEY)
    }

    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError> {
        self.put_record(CONFIG, CONFIG_KEY, overrides)?;
        debug!("Stored config overrides");
        Ok(())
    }
}
