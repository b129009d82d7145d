//! Typed gateway events.
//!
//! The gateway deserialises every frame into a [`GatewayEvent`]. Dispatch
//! frames (op 0) the bot reacts to become an [`InboundEvent`], which is the
//! only thing the runtime ever sees; heartbeat and session plumbing stays
//! inside the transport.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// Inbound events (what the runtime dispatches on)
// ---------------------------------------------------------------------------

/// A dispatch event delivered to the runtime by a shard.
///
/// Consumed once by [`crate::bot::Bot::dispatch`] and dropped afterwards.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Ready(ReadyEvent),
    MessageCreate(Message),
    MessageDelete(MessageDelete),
    GuildCreate(Guild),
    GuildDelete(UnavailableGuild),
    MemberJoin(GuildMemberAdd),
    MemberLeave(GuildMemberRemove),
    ReactionAdd(MessageReaction),
    ReactionRemove(MessageReaction),
}

/// Discriminant of [`InboundEvent`], used for logging and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    MessageCreate,
    MessageDelete,
    GuildCreate,
    GuildDelete,
    MemberJoin,
    MemberLeave,
    ReactionAdd,
    ReactionRemove,
}

impl EventKind {
    /// The gateway dispatch name (`t` field) of this kind.
    pub fn dispatch_name(self) -> &'static str {
        match self {
            EventKind::Ready => "READY",
            EventKind::MessageCreate => "MESSAGE_CREATE",
            EventKind::MessageDelete => "MESSAGE_DELETE",
            EventKind::GuildCreate => "GUILD_CREATE",
            EventKind::GuildDelete => "GUILD_DELETE",
            EventKind::MemberJoin => "GUILD_MEMBER_ADD",
            EventKind::MemberLeave => "GUILD_MEMBER_REMOVE",
            EventKind::ReactionAdd => "MESSAGE_REACTION_ADD",
            EventKind::ReactionRemove => "MESSAGE_REACTION_REMOVE",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dispatch_name())
    }
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Ready(_) => EventKind::Ready,
            InboundEvent::MessageCreate(_) => EventKind::MessageCreate,
            InboundEvent::MessageDelete(_) => EventKind::MessageDelete,
            InboundEvent::GuildCreate(_) => EventKind::GuildCreate,
            InboundEvent::GuildDelete(_) => EventKind::GuildDelete,
            InboundEvent::MemberJoin(_) => EventKind::MemberJoin,
            InboundEvent::MemberLeave(_) => EventKind::MemberLeave,
            InboundEvent::ReactionAdd(_) => EventKind::ReactionAdd,
            InboundEvent::ReactionRemove(_) => EventKind::ReactionRemove,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw gateway frames
// ---------------------------------------------------------------------------

/// A fully-parsed frame coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A dispatch the runtime cares about.
    Dispatch(InboundEvent),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The inner bool indicates whether
    /// the session is resumable (`true`) or we must re-identify (`false`).
    InvalidSession(bool),

    /// A frame we received but don't have a typed variant for.
    Unknown { event_name: Option<String>, op: u8 },
}

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails: unrecognised or malformed frames become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let (Some(name), Some(d)) = (event_name.as_deref(), data) else {
            return GatewayEvent::Unknown { event_name, op: 0 };
        };

        let parsed = match name {
            "READY" => typed(name, d, InboundEvent::Ready),
            "MESSAGE_CREATE" => typed(name, d, InboundEvent::MessageCreate),
            "MESSAGE_DELETE" => typed(name, d, InboundEvent::MessageDelete),
            "GUILD_CREATE" => typed(name, d, InboundEvent::GuildCreate),
            "GUILD_DELETE" => typed(name, d, InboundEvent::GuildDelete),
            "GUILD_MEMBER_ADD" => typed(name, d, InboundEvent::MemberJoin),
            "GUILD_MEMBER_REMOVE" => typed(name, d, InboundEvent::MemberLeave),
            "MESSAGE_REACTION_ADD" => typed(name, d, InboundEvent::ReactionAdd),
            "MESSAGE_REACTION_REMOVE" => typed(name, d, InboundEvent::ReactionRemove),
            _ => None,
        };

        match parsed {
            Some(event) => GatewayEvent::Dispatch(event),
            None => GatewayEvent::Unknown { event_name, op: 0 },
        }
    }
}

/// Deserialise a dispatch body and wrap it, logging payloads that don't fit.
fn typed<T: DeserializeOwned>(
    name: &str,
    data: serde_json::Value,
    wrap: impl FnOnce(T) -> InboundEvent,
) -> Option<InboundEvent> {
    match serde_json::from_value::<T>(data) {
        Ok(body) => Some(wrap(body)),
        Err(e) => {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
            None
        }
    }
}
