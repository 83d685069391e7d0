//! ============================================================================
//! Pass Service - Single entry point for the chat transport
//! ============================================================================
//! The transport hands every `/start` payload to `handle_start` and renders the
//! returned `StartReply`. Uploads from the ingestion side go through
//! `announce_upload`.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::{
    AccessFlow, AccessOutcome, ContentResolution, ExternalGate, FlowParts, GrantStore,
    MembershipOracle, RedeemOutcome, TimeRemaining,
};
use crate::clock::Clock;
use crate::config::{ConfigHandle, TokenPolicy, ALBUM_START_PREFIX};
use crate::db::{AlbumKey, MediaKind, PassBackend, UserProfile};
use crate::error::GateError;
use crate::media::{DeliveryReport, DeliveryScheduler, IngestReceipt, MediaRegistry, Payload, Sink};
use crate::token::{TokenCodec, TokenLedger, TOKEN_TAG};
use crate::users::UserDirectory;

/// Deep-link payload of a `/start` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartParam {
    Empty,
    Token(String),
    Album(String),
}

impl StartParam {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(hash) = raw.strip_prefix(ALBUM_START_PREFIX) {
            if hash.is_empty() {
                return StartParam::Empty;
            }
            return StartParam::Album(hash.to_string());
        }
        if raw.starts_with(TOKEN_TAG) {
            return StartParam::Token(raw.to_string());
        }
        StartParam::Empty
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub profile: UserProfile,
    pub param: StartParam,
}

impl StartRequest {
    pub fn new(profile: UserProfile, raw_param: Option<&str>) -> Self {
        Self {
            profile,
            param: raw_param.map(StartParam::parse).unwrap_or(StartParam::Empty),
        }
    }

    fn display_name(&self) -> &str {
        self.profile
            .first_name
            .as_deref()
            .or(self.profile.username.as_deref())
            .unwrap_or(self.profile.user_id.as_str())
    }
}

/// What happened to requested content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDelivery {
    NotRequested,
    Delivered(DeliveryReport),
    /// Album hash no longer resolves
    Missing(String),
}

/// Reply for the transport to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReply {
    /// Join these channels, then follow `retry_link`
    JoinChannels {
        join_links: Vec<String>,
        retry_link: Option<String>,
    },
    /// Watch the ad at `url` to get a pass
    AdRequired { url: String },
    /// Pass was already live
    AccessActive {
        remaining: TimeRemaining,
        content: ContentDelivery,
    },
    /// Pass granted by this request
    AccessGranted {
        expires_at: i64,
        remaining: TimeRemaining,
        content: ContentDelivery,
    },
    /// Token refused; `message` is generic on purpose
    Denied { message: &'static str },
    /// Something upstream failed; invite a retry when `retryable`
    Unavailable { retryable: bool },
}

/// Result of `announce_upload`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAnnouncement {
    pub receipt: IngestReceipt,
    /// This call flipped the album's announcement flag
    pub announced: bool,
}

/// Everything `PassService::assemble` needs
pub struct ServiceParts {
    pub backend: Arc<dyn PassBackend>,
    pub clock: Arc<dyn Clock>,
    pub policy: TokenPolicy,
    pub config: ConfigHandle,
    pub sink: Arc<dyn Sink>,
    pub gate: Arc<dyn ExternalGate>,
    pub membership: Arc<dyn MembershipOracle>,
}

pub struct PassService {
    flow: AccessFlow,
    scheduler: DeliveryScheduler,
    registry: Arc<MediaRegistry>,
    users: UserDirectory,
    config: ConfigHandle,
}

impl PassService {
    pub fn new(
        flow: AccessFlow,
        scheduler: DeliveryScheduler,
        registry: Arc<MediaRegistry>,
        users: UserDirectory,
    ) -> Self {
        let config = flow.config().clone();
        Self {
            flow,
            scheduler,
            registry,
            users,
            config,
        }
    }

    /// Wire every component over one backend and clock. Overrides persisted
    /// by `passgate-db config` are loaded here.
    pub fn assemble(parts: ServiceParts) -> Self {
        match parts.config.reload(parts.backend.as_ref()) {
            Ok(version) => debug!("Loaded persisted config (version {})", version),
            Err(e) => warn!(
                "Failed to load persisted config, using defaults (version {}): {}",
                parts.config.version(),
                e
            ),
        }
        let grants = Arc::new(GrantStore::new(parts.backend.clone(), parts.clock.clone()));
        let registry = Arc::new(MediaRegistry::new(parts.backend.clone(), parts.clock.clone()));
        let flow = AccessFlow::new(FlowParts {
            config: parts.config.clone(),
            clock: parts.clock.clone(),
            codec: TokenCodec::new(parts.policy, parts.clock.clone()),
            ledger: TokenLedger::new(parts.backend.clone(), parts.clock.clone()),
            grants: grants.clone(),
            registry: registry.clone(),
            gate: parts.gate,
            membership: parts.membership,
        });
        let scheduler = DeliveryScheduler::new(parts.sink, grants, parts.config.clone());
        let users = UserDirectory::new(parts.backend, parts.clock, parts.config);
        Self::new(flow, scheduler, registry, users)
    }

    pub fn flow(&self) -> &AccessFlow {
        &self.flow
    }

    pub fn scheduler(&self) -> &DeliveryScheduler {
        &self.scheduler
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn registry(&self) -> &Arc<MediaRegistry> {
        &self.registry
    }

    pub async fn handle_start(&self, request: StartRequest) -> StartReply {
        let user_id = request.profile.user_id.as_str();
        if let Err(e) = self.users.track(&request.profile) {
            warn!("Failed to track user {}: {}", user_id, e);
        }

        let result = match &request.param {
            StartParam::Token(token) => self.redeem(&request, token).await,
            StartParam::Album(hash) => self.request(&request, Some(hash)).await,
            StartParam::Empty => self.request(&request, None).await,
        };

        result.unwrap_or_else(|e| {
            warn!("Start for {} failed: {}", user_id, e);
            StartReply::Unavailable {
                retryable: e.is_retryable(),
            }
        })
    }

    async fn request(&self, request: &StartRequest, hash: Option<&str>) -> Result<StartReply, GateError> {
        let user_id = request.profile.user_id.as_str();
        let reply = match self.flow.request_access(user_id, hash).await? {
            AccessOutcome::AlreadyGranted { remaining, content } => StartReply::AccessActive {
                remaining,
                content: self.serve(request, content).await,
            },
            AccessOutcome::Granted {
                expires_at,
                content,
            } => {
                let remaining = self.flow.grants().time_remaining(user_id)?;
                StartReply::AccessGranted {
                    expires_at,
                    remaining,
                    content: self.serve(request, content).await,
                }
            }
            AccessOutcome::RedirectIssued { url, .. } => StartReply::AdRequired { url },
            AccessOutcome::NotEligible => {
                let config = self.config.snapshot().config;
                StartReply::JoinChannels {
                    join_links: config.join_links.clone(),
                    retry_link: hash.map(|h| config.links().album_link(h)),
                }
            }
        };
        Ok(reply)
    }

    async fn redeem(&self, request: &StartRequest, token: &str) -> Result<StartReply, GateError> {
        let user_id = request.profile.user_id.as_str();
        let reply = match self.flow.redeem(user_id, token).await? {
            RedeemOutcome::Redeemed {
                expires_at,
                content,
            } => {
                let remaining = self.flow.grants().time_remaining(user_id)?;
                StartReply::AccessGranted {
                    expires_at,
                    remaining,
                    content: self.serve(request, content).await,
                }
            }
            RedeemOutcome::Denied(reason) => StartReply::Denied {
                message: reason.user_message(),
            },
        };
        Ok(reply)
    }

    async fn serve(&self, request: &StartRequest, content: ContentResolution) -> ContentDelivery {
        match content {
            ContentResolution::None => ContentDelivery::NotRequested,
            ContentResolution::Missing(hash) => ContentDelivery::Missing(hash),
            ContentResolution::Resolved(album) => {
                let report = self
                    .scheduler
                    .deliver(&request.profile.user_id, &album, request.display_name())
                    .await;
                ContentDelivery::Delivered(report)
            }
        }
    }

    /// Ingest one upload part and, once per album, post its links to
    /// `destination`
    pub async fn announce_upload(
        &self,
        sink: &dyn Sink,
        destination: &str,
        group_key: Option<&str>,
        kind: MediaKind,
        file_ref: &str,
    ) -> Result<UploadAnnouncement, GateError> {
        let receipt = self.registry.ingest(group_key, kind, file_ref).await?;
        let key = match group_key {
            Some(group) => AlbumKey::Group(group),
            None => AlbumKey::Hash(&receipt.hash),
        };
        let announced = self.registry.mark_announced(key).await?;

        if announced {
            let links = self.config.snapshot().config.links();
            let text = format!(
                "New album ready.\nLink: {}\nShare: {}",
                links.album_link(&receipt.hash),
                links.share_link(&receipt.hash)
            );
            match sink.emit(destination, Payload::Text(text)).await {
                Ok(_) => info!("Announced album {} to {}", receipt.hash, destination),
                Err(e) => warn!("Failed to announce album {}: {}", receipt.hash, e),
            }
        } else {
            debug!("Album {} already announced", receipt.hash);
        }

        Ok(UploadAnnouncement { receipt, announced })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Membership;
    use crate::clock::{ManualClock, HOUR_MS, MINUTE_MS};
    use crate::config::{ConfigOverrides, GateConfig, DEFAULT_TOKEN_TTL_MS};
    use crate::db::MemoryDb;
    use crate::testing::{FakeGate, FakeMembership, RecordingSink};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        clock: Arc<ManualClock>,
        db: Arc<MemoryDb>,
        sink: Arc<RecordingSink>,
        gate: Arc<FakeGate>,
        service: PassService,
    }

    fn harness(config: GateConfig, membership: Membership) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let db = Arc::new(MemoryDb::new());
        let sink = Arc::new(RecordingSink::new());
        let gate = Arc::new(FakeGate::redirecting("https://short.example/ad"));
        let service = PassService::assemble(ServiceParts {
            backend: db.clone(),
            clock: clock.clone(),
            policy: TokenPolicy::new("service-test-secret", DEFAULT_TOKEN_TTL_MS).unwrap(),
            config: ConfigHandle::new(config),
            sink: sink.clone(),
            gate: gate.clone(),
            membership: Arc::new(FakeMembership::new(membership)),
        });
        Harness {
            clock,
            db,
            sink,
            gate,
            service,
        }
    }

    fn alice() -> UserProfile {
        UserProfile::new("42").with_first_name("Alice")
    }

    #[tokio::test]
    async fn test_assemble_loads_persisted_overrides() {
        let db = Arc::new(MemoryDb::new());
        db.put_config_overrides(&ConfigOverrides {
            ad_enabled: Some(false),
            ..Default::default()
        })
        .unwrap();

        let config = ConfigHandle::new(GateConfig::default());
        let before = config.version();
        let service = PassService::assemble(ServiceParts {
            backend: db.clone(),
            clock: Arc::new(ManualClock::new(T0)),
            policy: TokenPolicy::new("service-test-secret", DEFAULT_TOKEN_TTL_MS).unwrap(),
            config: config.clone(),
            sink: Arc::new(RecordingSink::new()),
            gate: Arc::new(FakeGate::redirecting("https://short.example/ad")),
            membership: Arc::new(FakeMembership::new(Membership::Member)),
        });

        assert!(config.version() > before);
        assert!(!config.snapshot().config.ad_enabled);
        let reply = service
            .handle_start(StartRequest::new(alice(), None))
            .await;
        assert!(matches!(reply, StartReply::AccessGranted { .. }), "{:?}", reply);
    }

    #[test]
    fn test_parse_start_param() {
        assert_eq!(StartParam::parse(""), StartParam::Empty);
        assert_eq!(StartParam::parse("album_abc123"), StartParam::Album("abc123".into()));
        assert_eq!(StartParam::parse("album_"), StartParam::Empty);
        assert_eq!(
            StartParam::parse("t1700000000000-42-0123456789abcdef"),
            StartParam::Token("t1700000000000-42-0123456789abcdef".into())
        );
        assert_eq!(StartParam::parse("hello"), StartParam::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ad_flow_delivers_and_retracts() {
        let h = harness(GateConfig::default(), Membership::Member);
        let admin = RecordingSink::new();
        let first = h
            .service
            .announce_upload(&admin, "admin", Some("g1"), MediaKind::Photo, "f1")
            .await
            .unwrap();
        let second = h
            .service
            .announce_upload(&admin, "admin", Some("g1"), MediaKind::Video, "f2")
            .await
            .unwrap();
        assert!(first.announced && !second.announced);
        assert_eq!(admin.texts("admin").len(), 1);
        let hash = first.receipt.hash;

        let param = format!("album_{}", hash);
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some(&param)))
            .await;
        assert_eq!(
            reply,
            StartReply::AdRequired {
                url: "https://short.example/ad".into()
            }
        );

        let long_url = h.gate.requests().remove(0);
        let token = long_url.rsplit("start=").next().unwrap().to_string();
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some(&token)))
            .await;
        let report = match reply {
            StartReply::AccessGranted {
                expires_at,
                remaining,
                content: ContentDelivery::Delivered(report),
            } => {
                assert_eq!(expires_at, T0 + 18 * HOUR_MS);
                assert_eq!(remaining.to_string(), "18h 0m");
                report
            }
            other => panic!("expected granted with delivery, got {:?}", other),
        };
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(h.sink.media("42"), vec!["f1".to_string(), "f2".to_string()]);

        h.clock.advance(15 * MINUTE_MS);
        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        assert_eq!(h.sink.retracted().len(), 2);
        let notices = h.sink.texts("42");
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| n.ends_with("Time left: 17h 45m")));

        // Same token again
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some(&token)))
            .await;
        assert!(matches!(reply, StartReply::Denied { .. }));
        assert_eq!(h.db.list_views().unwrap().get(&hash), Some(&1));
    }

    #[tokio::test]
    async fn test_active_pass_serves_album_directly() {
        let config = GateConfig {
            ad_enabled: false,
            ..GateConfig::default()
        };
        let h = harness(config, Membership::Member);
        let receipt = h
            .service
            .registry()
            .ingest(None, MediaKind::Photo, "solo")
            .await
            .unwrap();

        let reply = h.service.handle_start(StartRequest::new(alice(), None)).await;
        assert!(matches!(
            reply,
            StartReply::AccessGranted {
                content: ContentDelivery::NotRequested,
                ..
            }
        ));

        let param = format!("album_{}", receipt.hash);
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some(&param)))
            .await;
        match reply {
            StartReply::AccessActive {
                content: ContentDelivery::Delivered(report),
                ..
            } => assert_eq!(report.delivered.len(), 1),
            other => panic!("expected active pass with delivery, got {:?}", other),
        }
        assert_eq!(h.service.users().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_album_is_soft() {
        let config = GateConfig {
            ad_enabled: false,
            ..GateConfig::default()
        };
        let h = harness(config, Membership::Member);
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some("album_nothere00")))
            .await;
        assert!(matches!(
            reply,
            StartReply::AccessGranted {
                content: ContentDelivery::Missing(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_member_gets_join_links() {
        let config = GateConfig {
            channels: vec!["-1001".into()],
            join_links: vec!["https://t.me/+invite".into()],
            ..GateConfig::default()
        };
        let h = harness(config, Membership::NotMember);
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some("album_abc123")))
            .await;
        assert_eq!(
            reply,
            StartReply::JoinChannels {
                join_links: vec!["https://t.me/+invite".into()],
                retry_link: Some("https://t.me/passgate_bot?start=album_abc123".into()),
            }
        );
        assert!(h.gate.requests().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_invites_retry() {
        let h = harness(GateConfig::default(), Membership::Member);
        h.db.set_unavailable(true);
        let reply = h.service.handle_start(StartRequest::new(alice(), None)).await;
        assert_eq!(reply, StartReply::Unavailable { retryable: true });
    }

    #[tokio::test]
    async fn test_bad_token_is_generic_denial() {
        let h = harness(GateConfig::default(), Membership::Member);
        let reply = h
            .service
            .handle_start(StartRequest::new(alice(), Some("t123-42-zzzz")))
            .await;
        match reply {
            StartReply::Denied { message } => assert!(message.contains("invalid or expired")),
            other => panic!("expected denial, got {:?}", other),
        }
    }
}
