//! ============================================================================
//! Membership Checker - Channel membership eligibility
//! ============================================================================
//! A user is eligible only if every configured channel reports `Member`.
//! Channels are queried concurrently, each under its own timeout; a timeout or
//! error is `Unknown`, which fails closed.
//! ============================================================================

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::Membership;

/// Bot API base URL
const BOT_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn check_membership(&self, channel_id: &str, user_id: &str) -> Membership;
}

/// Check every channel; true only if all of them report `Member`.
/// An empty channel list means no membership requirement.
pub async fn check_all_channels(
    oracle: &dyn MembershipOracle,
    channels: &[String],
    user_id: &str,
    timeout: Duration,
) -> bool {
    if channels.is_empty() {
        return true;
    }

    let checks = channels.iter().map(|channel| async move {
        match tokio::time::timeout(timeout, oracle.check_membership(channel, user_id)).await {
            Ok(status) => (channel, status),
            Err(_) => {
                warn!(
                    "Membership check for {} in {} timed out after {:?}",
                    user_id, channel, timeout
                );
                (channel, Membership::Unknown)
            }
        }
    });

    let results = join_all(checks).await;
    let eligible = results.iter().all(|(_, status)| status.is_member());
    if !eligible {
        for (channel, status) in results.iter().filter(|(_, s)| !s.is_member()) {
            debug!("User {} not eligible via {}: {:?}", user_id, channel, status);
        }
    }
    eligible
}

/// `getChatMember`-backed oracle
pub struct BotApiMembership {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

#[derive(Debug, Deserialize)]
struct ChatMemberResponse {
    ok: bool,
    result: Option<ChatMember>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

impl BotApiMembership {
    pub fn new(bot_token: String, timeout: Duration) -> Self {
        Self::with_api_base(BOT_API, bot_token, timeout)
    }

    pub fn with_api_base(api_base: &str, bot_token: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token,
        }
    }

    /// Errors come back with the request URL stripped; it embeds the bot token
    async fn fetch_status(&self, channel_id: &str, user_id: &str) -> Result<Membership, String> {
        let url = format!("{}/bot{}/getChatMember", self.api_base, self.bot_token);
        let response = self
            .client
            .get(&url)
            .query(&[("chat_id", channel_id), ("user_id", user_id)])
            .send()
            .await
            .map_err(|e| format!("getChatMember request failed: {}", e.without_url()))?;

        // Bot API answers 400 for users who never joined
        match response.json::<ChatMemberResponse>().await {
            Ok(ChatMemberResponse {
                ok: true,
                result: Some(member),
            }) => Ok(if status_is_member(&member.status) {
                Membership::Member
            } else {
                Membership::NotMember
            }),
            Ok(_) => Ok(Membership::NotMember),
            Err(e) => Err(format!(
                "Failed to parse getChatMember response: {}",
                e.without_url()
            )),
        }
    }
}

/// Statuses that count as membership
fn status_is_member(status: &str) -> bool {
    matches!(status, "member" | "administrator" | "creator")
}

#[async_trait]
impl MembershipOracle for BotApiMembership {
    async fn check_membership(&self, channel_id: &str, user_id: &str) -> Membership {
        match self.fetch_status(channel_id, user_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Membership check in {} failed: {}", channel_id, e);
                Membership::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMembership;

    fn channels(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_channel_list_is_eligible() {
        let oracle = FakeMembership::new(Membership::NotMember);
        assert!(check_all_channels(&oracle, &[], "42", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_all_channels_must_match() {
        let oracle = FakeMembership::new(Membership::Member).with_channel("-1002", Membership::NotMember);
        let chans = channels(&["-1001", "-1002"]);
        assert!(!check_all_channels(&oracle, &chans, "42", Duration::from_secs(5)).await);

        let oracle = FakeMembership::new(Membership::Member);
        assert!(check_all_channels(&oracle, &chans, "42", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_unknown_fails_closed() {
        let oracle = FakeMembership::new(Membership::Unknown);
        let chans = channels(&["-1001"]);
        assert!(!check_all_channels(&oracle, &chans, "42", Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_not_member() {
        let oracle = FakeMembership::new(Membership::Member).with_delay(Duration::from_secs(30));
        let chans = channels(&["-1001"]);
        assert!(!check_all_channels(&oracle, &chans, "42", Duration::from_secs(5)).await);
    }

    #[test]
    fn test_member_statuses() {
        assert!(status_is_member("member"));
        assert!(status_is_member("administrator"));
        assert!(status_is_member("creator"));
        assert!(!status_is_member("left"));
        assert!(!status_is_member("kicked"));
        assert!(!status_is_member("restricted"));
    }

    #[tokio::test]
    async fn test_transport_error_hides_bot_token() {
        let oracle =
            BotApiMembership::with_api_base("http://127.0.0.1:1", "BOTSECRET".into(), Duration::from_secs(2));
        let err = oracle.fetch_status("-1001", "42").await.unwrap_err();
        assert!(!err.contains("BOTSECRET"), "leaked token: {}", err);
        assert_eq!(oracle.check_membership("-1001", "42").await, Membership::Unknown);
    }
}
