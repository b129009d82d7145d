//! In-memory transport used by the unit tests.
//!
//! Every outbound call is appended to a shared [`Recorder`] so tests can
//! assert on side effects and their order.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::events::InboundEvent;
use crate::transport::{Connection, ConnectionRef, EventStream, SessionStats, ShardInfo, Transport};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(u32),
    Close(u32),
    Send { channel: String, text: String },
    Delete { channel: String, message: String },
    React { channel: String, message: String, emoji: String },
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<StdMutex<Vec<Call>>>);

impl Recorder {
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds for the recorded calls, or give up after a
    /// second. Spawned side effects land asynchronously.
    pub async fn wait_until(&self, pred: impl Fn(&[Call]) -> bool) -> Vec<Call> {
        for _ in 0..200 {
            let calls = self.calls();
            if pred(&calls) {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.calls()
    }

    /// Give spawned tasks a chance to run, then return what was recorded.
    pub async fn settle(&self) -> Vec<Call> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.calls()
    }
}

/// Guild state the mock connection answers lookups with.
#[derive(Debug, Clone)]
pub struct MockGuild {
    pub roles: Vec<Role>,
    pub member_roles: Vec<Snowflake>,
    pub channel_kind: ChannelType,
}

impl Default for MockGuild {
    fn default() -> Self {
        Self {
            roles: vec![
                Role {
                    id: "900".into(),
                    name: "BAN_MEMBERS".into(),
                    position: 2,
                },
                Role {
                    id: "901".into(),
                    name: "regular".into(),
                    position: 1,
                },
            ],
            member_roles: vec!["901".into()],
            channel_kind: ChannelType::GuildText,
        }
    }
}

pub struct MockConnection {
    shard: ShardInfo,
    recorder: Recorder,
    guild: MockGuild,
    session: Mutex<SessionStats>,
    fail_outbound: bool,
}

impl MockConnection {
    pub fn new(shard: ShardInfo, recorder: Recorder, guild: MockGuild) -> Self {
        Self {
            shard,
            recorder,
            guild,
            session: Mutex::new(SessionStats::default()),
            fail_outbound: false,
        }
    }

    /// Record outbound calls but report each one as failed.
    pub fn failing(mut self) -> Self {
        self.fail_outbound = true;
        self
    }

    pub fn into_ref(self) -> ConnectionRef {
        Arc::new(self)
    }

    fn outcome(&self) -> Result<(), TransportError> {
        if self.fail_outbound {
            Err(TransportError::Gateway("simulated failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn shard(&self) -> ShardInfo {
        self.shard
    }

    fn session(&self) -> &Mutex<SessionStats> {
        &self.session
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), TransportError> {
        self.recorder.push(Call::Send {
            channel: channel_id.into(),
            text: content.into(),
        });
        self.outcome()
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), TransportError> {
        self.recorder.push(Call::Delete {
            channel: channel_id.into(),
            message: message_id.into(),
        });
        self.outcome()
    }

    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.recorder.push(Call::React {
            channel: channel_id.into(),
            message: message_id.into(),
            emoji: emoji.into(),
        });
        self.outcome()
    }

    async fn guild_member(
        &self,
        _guild_id: &str,
        user_id: &str,
    ) -> Result<GuildMember, TransportError> {
        Ok(GuildMember {
            user: Some(user(user_id, false)),
            nick: None,
            roles: self.guild.member_roles.clone(),
            joined_at: None,
        })
    }

    async fn guild_roles(&self, _guild_id: &str) -> Result<Vec<Role>, TransportError> {
        Ok(self.guild.roles.clone())
    }

    async fn channel(&self, channel_id: &str) -> Result<Channel, TransportError> {
        Ok(Channel {
            id: channel_id.into(),
            kind: self.guild.channel_kind,
            guild_id: Some("300".into()),
            name: Some("general".into()),
        })
    }

    async fn close(&self) {
        self.recorder.push(Call::Close(self.shard.index));
    }
}

/// Transport handing out [`MockConnection`]s, optionally failing one shard.
pub struct MockTransport {
    pub recorder: Recorder,
    pub guild: MockGuild,
    fail_at: Option<u32>,
    senders: StdMutex<Vec<mpsc::Sender<InboundEvent>>>,
}

impl MockTransport {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            guild: MockGuild::default(),
            fail_at: None,
            senders: StdMutex::new(Vec::new()),
        }
    }

    pub fn fail_at(mut self, index: u32) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Event sender for shard `index`, as if the gateway delivered it.
    pub fn sender(&self, index: usize) -> mpsc::Sender<InboundEvent> {
        self.senders.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, shard: ShardInfo) -> Result<(ConnectionRef, EventStream), TransportError> {
        self.recorder.push(Call::Open(shard.index));
        if self.fail_at == Some(shard.index) {
            return Err(TransportError::AuthenticationFailed);
        }
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().push(tx);
        let conn = MockConnection::new(shard, self.recorder.clone(), self.guild.clone());
        Ok((conn.into_ref(), rx))
    }
}

pub fn user(id: &str, bot: bool) -> User {
    User {
        id: id.into(),
        username: format!("user{}", id),
        discriminator: None,
        bot,
        global_name: None,
    }
}

pub fn message(content: &str) -> Message {
    Message {
        id: "100".into(),
        channel_id: "200".into(),
        guild_id: Some("300".into()),
        author: user("1", false),
        content: content.into(),
        timestamp: "2024-01-01T00:00:00Z".into(),
    }
}
