//! Fire-and-forget outbound helpers shared by commands and processors.
//!
//! Every call spawns its network work and returns immediately. Failures are
//! logged, never returned. The [`JoinHandle`] is only there for callers (and
//! tests) that want to wait; dropping it detaches the task.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::transport::ConnectionRef;
use crate::types::Message;

#[derive(Debug, Clone)]
pub struct Notifier {
    success_emoji: String,
    fail_emoji: String,
}

impl Notifier {
    pub fn new(success_emoji: impl Into<String>, fail_emoji: impl Into<String>) -> Self {
        Self {
            success_emoji: success_emoji.into(),
            fail_emoji: fail_emoji.into(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.success_emoji, &config.fail_emoji)
    }

    pub fn react_success(&self, conn: &ConnectionRef, msg: &Message) -> JoinHandle<()> {
        self.react(conn, msg, &self.success_emoji)
    }

    pub fn react_fail(&self, conn: &ConnectionRef, msg: &Message) -> JoinHandle<()> {
        self.react(conn, msg, &self.fail_emoji)
    }

    /// Add `emoji` (`name:id` or a unicode character) to `msg`.
    pub fn react(&self, conn: &ConnectionRef, msg: &Message, emoji: &str) -> JoinHandle<()> {
        let conn = conn.clone();
        let channel_id = msg.channel_id.clone();
        let message_id = msg.id.clone();
        let emoji = emoji.to_string();
        tokio::spawn(async move {
            match conn.add_reaction(&channel_id, &message_id, &emoji).await {
                Ok(()) => debug!(%channel_id, %message_id, %emoji, "reacted"),
                Err(e) => warn!(%channel_id, %message_id, %emoji, error = %e, "failed to react"),
            }
        })
    }

    /// Send `text` to the channel `msg` came from.
    pub fn reply(&self, conn: &ConnectionRef, msg: &Message, text: impl Into<String>) -> JoinHandle<()> {
        let conn = conn.clone();
        let channel_id = msg.channel_id.clone();
        let text = text.into();
        tokio::spawn(async move {
            if let Err(e) = conn.send_message(&channel_id, &text).await {
                warn!(%channel_id, error = %e, "failed to send reply");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_FAIL_EMOJI, DEFAULT_SUCCESS_EMOJI};
    use crate::testing::*;
    use crate::transport::ShardInfo;

    fn conn(recorder: &Recorder) -> ConnectionRef {
        MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), MockGuild::default()).into_ref()
    }

    #[tokio::test]
    async fn success_and_fail_use_configured_emoji() {
        let recorder = Recorder::default();
        let conn = conn(&recorder);
        let notifier = Notifier::from_config(&RuntimeConfig::default());
        let msg = message("hi");

        notifier.react_success(&conn, &msg).await.unwrap();
        notifier.react_fail(&conn, &msg).await.unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::React {
                    channel: "200".into(),
                    message: "100".into(),
                    emoji: DEFAULT_SUCCESS_EMOJI.into(),
                },
                Call::React {
                    channel: "200".into(),
                    message: "100".into(),
                    emoji: DEFAULT_FAIL_EMOJI.into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let recorder = Recorder::default();
        let conn = MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), MockGuild::default())
            .failing()
            .into_ref();
        let notifier = Notifier::new("ok", "no");

        notifier.react(&conn, &message("hi"), "👍").await.unwrap();
        notifier.reply(&conn, &message("hi"), "hello").await.unwrap();
        assert_eq!(recorder.calls().len(), 2);
    }
}
