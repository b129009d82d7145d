use std::sync::Arc;

use tracing::{debug, warn};

use super::{Command, Completion};
use crate::bot::Bot;
use crate::transport::{ConnectionRef, SessionStats};
use crate::types::Message;

/// Replies with the time of the shard's last acknowledged heartbeat.
pub struct Ping {
    usage: Vec<String>,
}

impl Ping {
    pub fn new() -> Self {
        Self {
            usage: vec!["ping - pong".to_string()],
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn usage(&self) -> Vec<String> {
        self.usage.clone()
    }

    fn run(&self, conn: ConnectionRef, _bot: Arc<Bot>, msg: Message, _args: String) -> Completion {
        Completion::spawn(async move {
            // Held across read, compose and send; released on every return.
            let stats = conn.session().lock().await;
            let text = pong_text(&stats);
            if let Err(e) = conn.send_message(&msg.channel_id, &text).await {
                warn!(shard = %conn.shard(), channel_id = %msg.channel_id, error = %e, "failed to send pong");
            } else {
                debug!(shard = %conn.shard(), channel_id = %msg.channel_id, "sent pong");
            }
            drop(stats);
            false
        })
    }
}

fn pong_text(stats: &SessionStats) -> String {
    match (stats.last_heartbeat_ack, stats.latency()) {
        (Some(at), Some(latency)) => {
            format!("Pong {} ({}ms)", at.to_rfc3339(), latency.num_milliseconds())
        }
        (Some(at), None) => format!("Pong {}", at.to_rfc3339()),
        (None, _) => "Pong (no heartbeat acknowledged yet)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{Bot, Registry};
    use crate::config::RuntimeConfig;
    use crate::testing::*;
    use crate::transport::ShardInfo;
    use chrono::{TimeZone, Utc};

    fn bot() -> Arc<Bot> {
        Arc::new(Bot::new(RuntimeConfig::default(), Registry::standard(&RuntimeConfig::default())))
    }

    #[test]
    fn usage_starts_with_ping_pong() {
        let usage = Ping::new().usage();
        assert!(!usage.is_empty());
        assert_eq!(usage[0], "ping - pong");
    }

    #[test]
    fn pong_text_includes_ack_time_and_latency() {
        let sent = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let stats = SessionStats {
            last_heartbeat_sent: Some(sent),
            last_heartbeat_ack: Some(sent + chrono::Duration::milliseconds(40)),
        };
        let text = pong_text(&stats);
        assert!(text.starts_with("Pong 2023-11-14T22:13:20.040"));
        assert!(text.ends_with("(40ms)"));
    }

    #[test]
    fn pong_text_without_heartbeat() {
        assert_eq!(
            pong_text(&SessionStats::default()),
            "Pong (no heartbeat acknowledged yet)"
        );
    }

    #[tokio::test]
    async fn run_sends_pong_and_resolves_false() {
        let recorder = Recorder::default();
        let conn = MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), MockGuild::default())
            .into_ref();

        let completion = Ping::new().run(conn, bot(), message("-mod ping"), String::new());
        assert!(!completion.wait().await);

        assert_eq!(
            recorder.calls(),
            vec![Call::Send {
                channel: "200".into(),
                text: "Pong (no heartbeat acknowledged yet)".into(),
            }]
        );
    }

    #[tokio::test]
    async fn failed_send_still_completes_and_releases_lock() {
        let recorder = Recorder::default();
        let conn = MockConnection::new(ShardInfo::new(0, 1), recorder.clone(), MockGuild::default())
            .failing()
            .into_ref();

        let completion = Ping::new().run(conn.clone(), bot(), message("-mod ping"), String::new());
        assert!(!completion.wait().await);
        assert!(conn.session().try_lock().is_ok());
    }
}
