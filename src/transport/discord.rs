//! The real transport: one gateway driver per shard plus a shared REST
//! client.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Connection, ConnectionRef, EventStream, SessionStats, ShardInfo, Transport};
use crate::error::TransportError;
use crate::gateway::{self, GatewayConfig, GatewayHandle};
use crate::http::DiscordHttpClient;
use crate::types::{Channel, GuildMember, Intents, Role};

/// Channels remembered per shard before the oldest entry is evicted.
const CHANNEL_CACHE_CAPACITY: usize = 1024;

/// Opens shards against Discord with one bot token.
#[derive(Debug, Clone)]
pub struct DiscordTransport {
    token: String,
    intents: Intents,
    http: DiscordHttpClient,
}

impl DiscordTransport {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            http: DiscordHttpClient::new(token.clone()),
            token,
            intents: Intents::moderation(),
        }
    }

    pub fn with_intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn open(&self, shard: ShardInfo) -> Result<(ConnectionRef, EventStream), TransportError> {
        let GatewayHandle {
            events,
            ready,
            stats,
            shutdown,
            driver,
        } = gateway::connect(GatewayConfig {
            token: self.token.clone(),
            intents: self.intents,
            shard,
        });

        let outcome = match ready.await {
            Ok(outcome) => outcome,
            // The driver ended without reporting either way.
            Err(_) => Err(TransportError::Closed),
        };
        if let Err(e) = outcome {
            let _ = shutdown.send(true);
            if let Err(join) = driver.await {
                warn!(%shard, error = %join, "gateway driver ended abnormally");
            }
            return Err(e);
        }

        let conn = DiscordConnection {
            shard,
            http: self.http.clone(),
            stats,
            shutdown,
            driver: Mutex::new(Some(driver)),
            channels: Mutex::new(ChannelCache::new(CHANNEL_CACHE_CAPACITY)),
        };
        Ok((Arc::new(conn), events))
    }
}

/// One open shard: its gateway driver and the shared REST client.
pub struct DiscordConnection {
    shard: ShardInfo,
    http: DiscordHttpClient,
    stats: Arc<Mutex<SessionStats>>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Channel kinds never change, so lookups are cached for the session.
    channels: Mutex<ChannelCache>,
}

#[async_trait]
impl Connection for DiscordConnection {
    fn shard(&self) -> ShardInfo {
        self.shard
    }

    fn session(&self) -> &Mutex<SessionStats> {
        &*self.stats
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), TransportError> {
        self.http.send_message(channel_id, content).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), TransportError> {
        Ok(self.http.delete_message(channel_id, message_id).await?)
    }

    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), TransportError> {
        Ok(self.http.add_reaction(channel_id, message_id, emoji).await?)
    }

    async fn guild_member(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<GuildMember, TransportError> {
        Ok(self.http.get_guild_member(guild_id, user_id).await?)
    }

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>, TransportError> {
        Ok(self.http.get_guild_roles(guild_id).await?)
    }

    async fn channel(&self, channel_id: &str) -> Result<Channel, TransportError> {
        if let Some(channel) = self.channels.lock().await.get(channel_id) {
            return Ok(channel.clone());
        }

        let channel = self.http.get_channel(channel_id).await?;
        self.channels
            .lock()
            .await
            .insert(channel_id, channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let Some(driver) = self.driver.lock().await.take() else {
            return;
        };
        match driver.await {
            Ok(()) => debug!(shard = %self.shard, "gateway driver finished"),
            Err(e) => warn!(shard = %self.shard, error = %e, "gateway driver ended abnormally"),
        }
    }
}

impl std::fmt::Debug for DiscordConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConnection")
            .field("shard", &self.shard)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered channel lookups with a fixed capacity; the oldest
/// entry goes first.
#[derive(Debug)]
struct ChannelCache {
    capacity: usize,
    entries: HashMap<String, Channel>,
    order: VecDeque<String>,
}

impl ChannelCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.entries.get(channel_id)
    }

    fn insert(&mut self, channel_id: &str, channel: Channel) {
        if self.entries.insert(channel_id.to_string(), channel).is_some() {
            return;
        }
        self.order.push_back(channel_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
