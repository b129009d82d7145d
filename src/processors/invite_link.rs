//! Deletes messages carrying links to blacklisted hosts (Discord invites by
//! default), unless the author holds an exempt role.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::MessageProcessor;
use crate::bot::Bot;
use crate::transport::ConnectionRef;
use crate::types::Message;

/// How many acted-on message ids (deleted or exemption-announced) to
/// remember for redelivery suppression.
const RECENT_CAPACITY: usize = 256;

pub const EXEMPT_NOTICE: &str = "You are exempt from invite link inspection";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InviteLinkConfig {
    /// Hosts compared for exact equality against each parsed URL's host.
    pub blacklisted_hosts: HashSet<String>,
    /// Tokens of this length or shorter are never inspected.
    pub min_token_length: usize,
    /// Role names whose holders skip inspection entirely.
    pub exempt_roles: HashSet<String>,
}

impl Default for InviteLinkConfig {
    fn default() -> Self {
        Self {
            blacklisted_hosts: ["discord.gg"].into_iter().map(String::from).collect(),
            min_token_length: 10,
            exempt_roles: [
                "ADMINISTRATOR",
                "BAN_MEMBERS",
                "KICK_MEMBERS",
                "MANAGE_ROLES",
                "MANAGE_MESSAGES",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

pub struct InviteLinkFilter {
    config: InviteLinkConfig,
    recent: Mutex<VecDeque<String>>,
}

impl InviteLinkFilter {
    pub fn new(config: InviteLinkConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    /// First whitespace-separated token that parses as a URL on a blacklisted
    /// host. Later tokens are not looked at.
    pub fn find_blacklisted<'a>(&self, content: &'a str) -> Option<&'a str> {
        content
            .split_whitespace()
            .filter(|token| token.len() > self.config.min_token_length)
            .find(|token| {
                Url::parse(token)
                    .ok()
                    .and_then(|url| url.host_str().map(|host| self.config.blacklisted_hosts.contains(host)))
                    .unwrap_or(false)
            })
    }

    /// Whether the author holds any exempt role. Lookup failures count as
    /// "not exempt".
    async fn is_exempt(&self, conn: &ConnectionRef, msg: &Message) -> bool {
        let Some(guild_id) = msg.guild_id.as_deref() else {
            return false;
        };

        let member = match conn.guild_member(guild_id, &msg.author.id).await {
            Ok(member) => member,
            Err(e) => {
                warn!(guild_id, user_id = %msg.author.id, error = %e, "failed to fetch member");
                return false;
            }
        };
        if member.roles.is_empty() {
            return false;
        }

        let roles = match conn.guild_roles(guild_id).await {
            Ok(roles) => roles,
            Err(e) => {
                warn!(guild_id, error = %e, "failed to fetch guild roles");
                return false;
            }
        };

        roles
            .iter()
            .filter(|role| member.roles.contains(&role.id))
            .any(|role| self.config.exempt_roles.contains(&role.name))
    }

    /// Remember `message_id`; returns `false` if it was already seen.
    async fn first_sighting(&self, message_id: &str) -> bool {
        let mut recent = self.recent.lock().await;
        if recent.iter().any(|id| id == message_id) {
            return false;
        }
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(message_id.to_string());
        true
    }
}

impl Default for InviteLinkFilter {
    fn default() -> Self {
        Self::new(InviteLinkConfig::default())
    }
}

#[async_trait]
impl MessageProcessor for InviteLinkFilter {
    fn name(&self) -> &str {
        "invite_link"
    }

    async fn on_message(&self, _bot: &Bot, conn: &ConnectionRef, msg: &Message) -> bool {
        if self.is_exempt(conn, msg).await {
            debug!(user_id = %msg.author.id, "author exempt from invite inspection");
            if !self.first_sighting(&msg.id).await {
                debug!(message_id = %msg.id, "exemption already announced, skipping redelivery");
                return false;
            }
            if let Err(e) = conn.send_message(&msg.channel_id, EXEMPT_NOTICE).await {
                warn!(channel_id = %msg.channel_id, error = %e, "failed to send exemption notice");
            }
            return false;
        }

        let Some(link) = self.find_blacklisted(&msg.content) else {
            return false;
        };

        if !self.first_sighting(&msg.id).await {
            debug!(message_id = %msg.id, "invite link already handled, skipping redelivery");
            return true;
        }

        info!(
            message_id = %msg.id,
            channel_id = %msg.channel_id,
            author = %msg.author.tag(),
            link,
            "removing blacklisted invite link"
        );

        if let Err(e) = conn.delete_message(&msg.channel_id, &msg.id).await {
            warn!(message_id = %msg.id, error = %e, "failed to delete invite link message");
        }

        let warning = format!(
            "Bad {}, you can't send invite links here!",
            msg.author.mention()
        );
        if let Err(e) = conn.send_message(&msg.channel_id, &warning).await {
            warn!(channel_id = %msg.channel_id, error = %e, "failed to send invite link warning");
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Registry;
    use crate::config::RuntimeConfig;
    use crate::testing::*;
    use crate::transport::ShardInfo;

    fn setup(guild: MockGuild) -> (Bot, ConnectionRef, Recorder) {
        let bot = Bot::new(RuntimeConfig::default(), Registry::empty());
        let recorder = Recorder::default();
        let conn = MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), guild).into_ref();
        (bot, conn, recorder)
    }

    #[tokio::test]
    async fn deletes_and_warns_on_invite_link() {
        let (bot, conn, recorder) = setup(MockGuild::default());
        let filter = InviteLinkFilter::default();

        let handled = filter
            .on_message(&bot, &conn, &message("join now http://discord.gg/abc123"))
            .await;

        assert!(handled);
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Delete {
                    channel: "200".into(),
                    message: "100".into(),
                },
                Call::Send {
                    channel: "200".into(),
                    text: "Bad <@1>, you can't send invite links here!".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn ignores_plain_text() {
        let (bot, conn, recorder) = setup(MockGuild::default());
        let filter = InviteLinkFilter::default();

        assert!(!filter.on_message(&bot, &conn, &message("hello there")).await);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn exempt_role_skips_inspection() {
        let guild = MockGuild {
            member_roles: vec!["900".into()],
            ..MockGuild::default()
        };
        let (bot, conn, recorder) = setup(guild);
        let filter = InviteLinkFilter::default();

        let handled = filter
            .on_message(&bot, &conn, &message("join now http://discord.gg/abc123"))
            .await;

        assert!(!handled);
        assert_eq!(
            recorder.calls(),
            vec![Call::Send {
                channel: "200".into(),
                text: EXEMPT_NOTICE.into(),
            }]
        );
    }

    #[tokio::test]
    async fn redelivered_message_is_not_acted_on_twice() {
        let (bot, conn, recorder) = setup(MockGuild::default());
        let filter = InviteLinkFilter::default();
        let msg = message("https://discord.gg/xyz789");

        assert!(filter.on_message(&bot, &conn, &msg).await);
        assert!(filter.on_message(&bot, &conn, &msg).await);
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn redelivered_exempt_message_announces_once() {
        let guild = MockGuild {
            member_roles: vec!["900".into()],
            ..MockGuild::default()
        };
        let (bot, conn, recorder) = setup(guild);
        let filter = InviteLinkFilter::default();
        let msg = message("hello there");

        assert!(!filter.on_message(&bot, &conn, &msg).await);
        assert!(!filter.on_message(&bot, &conn, &msg).await);
        assert_eq!(recorder.sends(), vec![EXEMPT_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn failed_delete_still_warns_and_reports_handled() {
        let bot = Bot::new(RuntimeConfig::default(), Registry::empty());
        let recorder = Recorder::default();
        let conn = MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), MockGuild::default())
            .failing()
            .into_ref();

        let handled = InviteLinkFilter::default()
            .on_message(&bot, &conn, &message("http://discord.gg/abc123"))
            .await;

        assert!(handled);
        assert_eq!(recorder.sends().len(), 1);
    }

    #[test]
    fn short_tokens_are_not_inspected() {
        let filter = InviteLinkFilter::default();
        // exactly 10 characters: skipped
        assert_eq!(filter.find_blacklisted("http://a.b"), None);
        let config = InviteLinkConfig {
            blacklisted_hosts: ["a.b".to_string()].into(),
            ..InviteLinkConfig::default()
        };
        let filter = InviteLinkFilter::new(config);
        assert_eq!(filter.find_blacklisted("http://a.b"), None);
        assert_eq!(filter.find_blacklisted("http://a.b/x"), Some("http://a.b/x"));
    }

    #[test]
    fn host_must_match_exactly() {
        let filter = InviteLinkFilter::default();
        assert_eq!(filter.find_blacklisted("https://notdiscord.gg/abc"), None);
        assert_eq!(filter.find_blacklisted("https://discord.gg.evil.com/abc"), None);
        assert_eq!(filter.find_blacklisted("discord.gg/abcdefgh"), None);
    }

    #[test]
    fn first_matching_token_wins() {
        let config = InviteLinkConfig {
            blacklisted_hosts: ["discord.gg".to_string(), "discord.com".to_string()].into(),
            ..InviteLinkConfig::default()
        };
        let filter = InviteLinkFilter::new(config);
        assert_eq!(
            filter.find_blacklisted("see https://discord.com/invite/a and https://discord.gg/b"),
            Some("https://discord.com/invite/a")
        );
    }
}
