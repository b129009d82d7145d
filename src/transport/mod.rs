//! The seam between the runtime and whatever speaks the wire protocol.
//!
//! The runtime only ever talks to a [`Transport`] (to open shards) and to the
//! [`Connection`] each shard hands back (to send, delete, react and look up
//! guild state). Everything about WebSockets, heartbeats, resumes and REST
//! rate limits lives behind these traits, in [`discord`] for the real thing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::events::InboundEvent;
use crate::types::{Channel, GuildMember, Role};

#[cfg(feature = "io")]
pub mod discord;

/// Events delivered by one shard, in the order the transport received them.
pub type EventStream = mpsc::Receiver<InboundEvent>;

/// Shared handle to an open shard connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// Which slice of the bot's guilds a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    /// 0-based shard index, always `< count`.
    pub index: u32,
    pub count: u32,
}

impl ShardInfo {
    pub fn new(index: u32, count: u32) -> Self {
        debug_assert!(index < count, "shard index {} out of range {}", index, count);
        Self { index, count }
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

/// Mutable per-connection session bookkeeping.
///
/// Lives behind [`Connection::session`]; the transport writes it, commands
/// read it while holding the lock.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    pub last_heartbeat_ack: Option<DateTime<Utc>>,
}

impl SessionStats {
    /// Round trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> Option<chrono::Duration> {
        match (self.last_heartbeat_sent, self.last_heartbeat_ack) {
            (Some(sent), Some(ack)) if ack >= sent => Some(ack - sent),
            _ => None,
        }
    }

    /// Record an acknowledgement, ignoring ones older than what we have.
    pub fn record_ack(&mut self, at: DateTime<Utc>) {
        if self.last_heartbeat_ack.map_or(true, |prev| prev < at) {
            self.last_heartbeat_ack = Some(at);
        }
    }
}

/// One open shard connection.
///
/// Implementations must be safe to call from many tasks at once: handlers
/// from the owning shard and spawned command work share the same handle.
#[async_trait]
pub trait Connection: Send + Sync {
    fn shard(&self) -> ShardInfo;

    /// Lock-protected session stats (last heartbeat ack and friends).
    fn session(&self) -> &Mutex<SessionStats>;

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), TransportError>;

    async fn delete_message(&self, channel_id: &str, message_id: &str)
        -> Result<(), TransportError>;

    /// `emoji` is `name:id` for custom emoji or the bare unicode character.
    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), TransportError>;

    async fn guild_member(&self, guild_id: &str, user_id: &str)
        -> Result<GuildMember, TransportError>;

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>, TransportError>;

    async fn channel(&self, channel_id: &str) -> Result<Channel, TransportError>;

    /// Close the connection. Returns once the transport reports it closed.
    async fn close(&self);
}

/// Opens shard connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection for `shard`, resolving once it is ready to deliver
    /// events. Fatal failures (bad token, invalid shard) surface here.
    async fn open(&self, shard: ShardInfo) -> Result<(ConnectionRef, EventStream), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn latency_needs_ack_after_send() {
        let sent = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut stats = SessionStats {
            last_heartbeat_sent: Some(sent),
            last_heartbeat_ack: None,
        };
        assert!(stats.latency().is_none());

        stats.record_ack(sent + chrono::Duration::milliseconds(42));
        assert_eq!(stats.latency(), Some(chrono::Duration::milliseconds(42)));
    }

    #[test]
    fn record_ack_keeps_newest() {
        let newer = Utc.timestamp_opt(2_000, 0).unwrap();
        let older = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut stats = SessionStats::default();
        stats.record_ack(newer);
        stats.record_ack(older);
        assert_eq!(stats.last_heartbeat_ack, Some(newer));
    }

    #[test]
    fn shard_info_displays_as_fraction() {
        assert_eq!(ShardInfo::new(1, 4).to_string(), "1/4");
    }
}
