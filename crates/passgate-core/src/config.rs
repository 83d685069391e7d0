//! ============================================================================
//! Configuration - Reloadable gate settings and the frozen token policy
//! ============================================================================
//! Two kinds of settings live here:
//! - `GateConfig`: read-mostly values an operator may change at runtime
//!   (ad flag, channels, access window). Held behind `ConfigHandle`, which
//!   hands out versioned snapshots and has a single reload point.
//! - `TokenPolicy`: the signing secret and token TTL. Fixed for the life of
//!   the process so no outstanding token changes validity mid-flight.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{HOUR_MS, MINUTE_MS};
use crate::db::PassBackend;
use crate::error::{GateError, StoreError};

/// Default access window granted on activation (18 hours)
pub const DEFAULT_ACCESS_WINDOW_MS: i64 = 18 * HOUR_MS;

/// Default token lifetime, measured from the issue timestamp (18 hours)
pub const DEFAULT_TOKEN_TTL_MS: i64 = 18 * HOUR_MS;

/// Default delay before delivered media is retracted (15 minutes)
pub const DEFAULT_RETRACTION_DELAY_MS: i64 = 15 * MINUTE_MS;

/// Deep-link payload prefix that addresses an album by hash
pub const ALBUM_START_PREFIX: &str = "album_";

const DEFAULT_SHORTENER_HOST: &str = "earnlinks.in";

/// Runtime-adjustable gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Require the external ad step before issuing a token
    pub ad_enabled: bool,
    /// Length of the access window granted on activation
    pub access_window_ms: i64,
    /// Channels a user must belong to before any grant (empty = no check)
    pub channels: Vec<String>,
    /// Invite links shown to users who are not yet members
    pub join_links: Vec<String>,
    /// Bot username used to build deep links
    pub bot_username: String,
    /// Host of the link-shortener ad gate
    pub shortener_host: String,
    /// API token for the link shortener
    pub shortener_api_token: Option<String>,
    /// Bot API token used for membership checks
    pub bot_api_token: Option<String>,
    /// Delay before delivered media is retracted
    pub retraction_delay_ms: i64,
    pub membership_timeout_ms: u64,
    pub gate_timeout_ms: u64,
    /// Pause between broadcast sends
    pub broadcast_pacing_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ad_enabled: true,
            access_window_ms: DEFAULT_ACCESS_WINDOW_MS,
            channels: Vec::new(),
            join_links: Vec::new(),
            bot_username: "passgate_bot".to_string(),
            shortener_host: DEFAULT_SHORTENER_HOST.to_string(),
            shortener_api_token: None,
            bot_api_token: None,
            retraction_delay_ms: DEFAULT_RETRACTION_DELAY_MS,
            membership_timeout_ms: 5_000,
            gate_timeout_ms: 10_000,
            broadcast_pacing_ms: 100,
        }
    }
}

impl GateConfig {
    /// Build from `PASSGATE_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ad_enabled: env_bool("PASSGATE_AD_ENABLED").unwrap_or(defaults.ad_enabled),
            access_window_ms: env_parse("PASSGATE_ACCESS_WINDOW_MS")
                .unwrap_or(defaults.access_window_ms),
            channels: env_list("PASSGATE_CHANNELS").unwrap_or(defaults.channels),
            join_links: env_list("PASSGATE_JOIN_LINKS").unwrap_or(defaults.join_links),
            bot_username: std::env::var("PASSGATE_BOT_USERNAME").unwrap_or(defaults.bot_username),
            shortener_host: std::env::var("PASSGATE_SHORTENER_HOST")
                .unwrap_or(defaults.shortener_host),
            shortener_api_token: std::env::var("PASSGATE_SHORTENER_API_TOKEN").ok(),
            bot_api_token: std::env::var("PASSGATE_BOT_API_TOKEN").ok(),
            retraction_delay_ms: env_parse("PASSGATE_RETRACTION_DELAY_MS")
                .unwrap_or(defaults.retraction_delay_ms),
            membership_timeout_ms: env_parse("PASSGATE_MEMBERSHIP_TIMEOUT_MS")
                .unwrap_or(defaults.membership_timeout_ms),
            gate_timeout_ms: env_parse("PASSGATE_GATE_TIMEOUT_MS")
                .unwrap_or(defaults.gate_timeout_ms),
            broadcast_pacing_ms: env_parse("PASSGATE_BROADCAST_PACING_MS")
                .unwrap_or(defaults.broadcast_pacing_ms),
        }
    }

    /// Apply operator overrides on top of this config
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(v) = overrides.ad_enabled {
            self.ad_enabled = v;
        }
        if let Some(v) = overrides.access_window_ms {
            self.access_window_ms = v;
        }
        if let Some(v) = &overrides.channels {
            self.channels = v.clone();
        }
        if let Some(v) = &overrides.join_links {
            self.join_links = v.clone();
        }
        if let Some(v) = &overrides.bot_username {
            self.bot_username = v.clone();
        }
        if let Some(v) = &overrides.shortener_host {
            self.shortener_host = v.clone();
        }
        if let Some(v) = &overrides.shortener_api_token {
            self.shortener_api_token = Some(v.clone());
        }
        if let Some(v) = overrides.retraction_delay_ms {
            self.retraction_delay_ms = v;
        }
        self
    }

    pub fn retraction_delay(&self) -> Duration {
        Duration::from_millis(self.retraction_delay_ms.max(0) as u64)
    }

    pub fn links(&self) -> LinkBuilder {
        LinkBuilder::new(&self.bot_username)
    }
}

/// Operator overrides persisted in the store's config table.
/// `None` leaves the underlying value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigOverrides {
    pub ad_enabled: Option<bool>,
    pub access_window_ms: Option<i64>,
    pub channels: Option<Vec<String>>,
    pub join_links: Option<Vec<String>>,
    pub bot_username: Option<String>,
    pub shortener_host: Option<String>,
    pub shortener_api_token: Option<String>,
    pub retraction_delay_ms: Option<i64>,
}

impl ConfigOverrides {
    /// Merge `newer` into self; values set in `newer` win
    pub fn merge(&mut self, newer: ConfigOverrides) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if newer.$field.is_some() { self.$field = newer.$field; })*
            };
        }
        take!(
            ad_enabled,
            access_window_ms,
            channels,
            join_links,
            bot_username,
            shortener_host,
            shortener_api_token,
            retraction_delay_ms
        );
    }
}

/// A config value together with the version it was published under
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<GateConfig>,
}

struct HandleState {
    base: GateConfig,
    overrides: ConfigOverrides,
    current: ConfigSnapshot,
}

/// Shared, versioned access to the live `GateConfig`.
///
/// Components call [`ConfigHandle::snapshot`] once per request and use that
/// value for the whole request, so a reload never changes settings halfway
/// through a flow. `apply` and `reload` are the only mutation points.
#[derive(Clone)]
pub struct ConfigHandle {
    state: Arc<RwLock<HandleState>>,
}

impl ConfigHandle {
    pub fn new(base: GateConfig) -> Self {
        let current = ConfigSnapshot {
            version: 1,
            config: Arc::new(base.clone()),
        };
        Self {
            state: Arc::new(RwLock::new(HandleState {
                base,
                overrides: ConfigOverrides::default(),
                current,
            })),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.current.clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Layer `overrides` onto the current ones and publish a new version
    pub fn apply(&self, overrides: ConfigOverrides) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.overrides.merge(overrides);
        let config = state.base.clone().with_overrides(&state.overrides);
        let version = state.current.version + 1;
        state.current = ConfigSnapshot {
            version,
            config: Arc::new(config),
        };
        info!("Config updated to version {}", version);
        version
    }

    /// Re-read persisted overrides from the store and publish them
    pub fn reload(&self, backend: &dyn PassBackend) -> Result<u64, StoreError> {
        let persisted = backend.get_config_overrides()?.unwrap_or_default();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.overrides = persisted;
        let config = state.base.clone().with_overrides(&state.overrides);
        let version = state.current.version + 1;
        state.current = ConfigSnapshot {
            version,
            config: Arc::new(config),
        };
        info!("Config reloaded from store (version {})", version);
        Ok(version)
    }

    /// Persist `overrides` (merged with what is stored) and publish them
    pub fn update(
        &self,
        backend: &dyn PassBackend,
        overrides: ConfigOverrides,
    ) -> Result<u64, StoreError> {
        let mut persisted = backend.get_config_overrides()?.unwrap_or_default();
        persisted.merge(overrides);
        backend.put_config_overrides(&persisted)?;
        self.reload(backend)
    }
}

/// Signing secret and token lifetime.
///
/// Frozen at construction: nothing in the crate can change either value on a
/// live policy, which keeps verification stable for every outstanding token.
#[derive(Clone)]
pub struct TokenPolicy {
    secret: Arc<[u8]>,
    ttl_ms: i64,
}

impl TokenPolicy {
    pub fn new(secret: impl AsRef<[u8]>, ttl_ms: i64) -> Result<Self, GateError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(GateError::Config("token secret must not be empty".into()));
        }
        if ttl_ms <= 0 {
            return Err(GateError::Config(format!("token TTL must be positive, got {}", ttl_ms)));
        }
        Ok(Self {
            secret: Arc::from(secret),
            ttl_ms,
        })
    }

    /// Read `PASSGATE_TOKEN_SECRET` (required) and `PASSGATE_TOKEN_TTL_MS`
    pub fn from_env() -> Result<Self, GateError> {
        let secret = std::env::var("PASSGATE_TOKEN_SECRET")
            .map_err(|_| GateError::Config("PASSGATE_TOKEN_SECRET is not set".into()))?;
        if secret.len() < 16 {
            warn!("PASSGATE_TOKEN_SECRET is shorter than 16 bytes");
        }
        let ttl_ms = env_parse("PASSGATE_TOKEN_TTL_MS").unwrap_or(DEFAULT_TOKEN_TTL_MS);
        Self::new(secret, ttl_ms)
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }
}

impl fmt::Debug for TokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPolicy")
            .field("secret", &"<redacted>")
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

/// Builds deep links into the bot
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base: String,
}

impl LinkBuilder {
    pub fn new(bot_username: &str) -> Self {
        Self {
            base: format!("https://t.me/{}", bot_username.trim_start_matches('@')),
        }
    }

    /// Link the user follows back after the ad step
    pub fn redeem_link(&self, token: &str) -> String {
        format!("{}?start={}", self.base, token)
    }

    pub fn album_link(&self, hash: &str) -> String {
        format!("{}?start={}{}", self.base, ALBUM_START_PREFIX, hash)
    }

    pub fn share_link(&self, hash: &str) -> String {
        format!(
            "https://t.me/share/url?url={}",
            urlencoding::encode(&self.album_link(hash))
        )
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert!(config.ad_enabled);
        assert_eq!(config.access_window_ms, 18 * HOUR_MS);
        assert_eq!(config.retraction_delay(), Duration::from_secs(900));
    }

    #[test]
    fn test_apply_bumps_version_and_layers() {
        let handle = ConfigHandle::new(GateConfig::default());
        let before = handle.snapshot();
        assert_eq!(before.version, 1);

        let v = handle.apply(ConfigOverrides {
            ad_enabled: Some(false),
            ..Default::default()
        });
        assert_eq!(v, 2);
        let v = handle.apply(ConfigOverrides {
            channels: Some(vec!["-1001".into()]),
            ..Default::default()
        });
        assert_eq!(v, 3);

        let after = handle.snapshot();
        assert!(!after.config.ad_enabled);
        assert_eq!(after.config.channels, vec!["-1001".to_string()]);
        // Old snapshot is unaffected
        assert!(before.config.ad_enabled);
    }

    #[test]
    fn test_update_persists_overrides() {
        let db = MemoryDb::new();
        let handle = ConfigHandle::new(GateConfig::default());
        handle
            .update(
                &db,
                ConfigOverrides {
                    ad_enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let fresh = ConfigHandle::new(GateConfig::default());
        assert!(fresh.snapshot().config.ad_enabled);
        fresh.reload(&db).unwrap();
        assert!(!fresh.snapshot().config.ad_enabled);
    }

    #[test]
    fn test_token_policy_rejects_empty_secret() {
        assert!(TokenPolicy::new("", DEFAULT_TOKEN_TTL_MS).is_err());
        assert!(TokenPolicy::new("secret", 0).is_err());
        let policy = TokenPolicy::new("secret", DEFAULT_TOKEN_TTL_MS).unwrap();
        assert!(format!("{:?}", policy).contains("<redacted>"));
    }

    #[test]
    fn test_links() {
        let links = LinkBuilder::new("@night_bot");
        assert_eq!(links.redeem_link("t1-2-ab"), "https://t.me/night_bot?start=t1-2-ab");
        assert_eq!(links.album_link("abc123"), "https://t.me/night_bot?start=album_abc123");
        assert!(links.share_link("abc123").starts_with("https://t.me/share/url?url=https%3A%2F%2F"));
    }
}
