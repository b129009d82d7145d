//! Event handlers for the bot.
//!
//! Each public function in this module handles one category of inbound
//! event. [`crate::bot::Bot::dispatch`] picks the handler; handlers receive
//! the shared [`Bot`] and the connection of the shard that delivered the
//! event. Nothing here returns an error: failures are logged and the shard
//! moves on to its next event.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::bot::Bot;
use crate::transport::ConnectionRef;
use crate::types::*;

// ---------------------------------------------------------------------------
// Command line parsing
// ---------------------------------------------------------------------------

/// A message addressed to the bot: `<prefix> <keyword>[ <args>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub keyword: &'a str,
    /// Everything after the single separator following the keyword, untouched.
    pub args: &'a str,
}

/// Split `content` into an [`Invocation`] if its first token is exactly
/// `prefix`.
///
/// The prefix is separated from the keyword by a whitespace run; the keyword
/// from the arguments by exactly one whitespace character.
pub fn parse_invocation<'a>(content: &'a str, prefix: &str) -> Option<Invocation<'a>> {
    let (candidate, rest) = match content.split_once(char::is_whitespace) {
        Some((candidate, rest)) => (candidate, rest.trim_start()),
        None => (content, ""),
    };
    if candidate != prefix {
        return None;
    }

    let (keyword, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Some(Invocation { keyword, args })
}

// ---------------------------------------------------------------------------
// READY handler
// ---------------------------------------------------------------------------

pub fn on_ready(conn: &ConnectionRef, ready: &ReadyEvent) {
    info!(
        shard = %conn.shard(),
        user = %ready.user.tag(),
        guilds = ready.guilds.len(),
        "shard ready"
    );
}

// ---------------------------------------------------------------------------
// MESSAGE_CREATE handler
// ---------------------------------------------------------------------------

/// Resolve a command invocation, or acknowledge the message and run the
/// message-create processor chain.
pub async fn on_message(bot: &Arc<Bot>, conn: &ConnectionRef, msg: Message) {
    if msg.author.bot {
        trace!(message_id = %msg.id, "ignoring bot author");
        return;
    }

    match conn.channel(&msg.channel_id).await {
        Ok(channel) if channel.kind == ChannelType::GuildText => {}
        Ok(channel) => {
            trace!(channel_id = %msg.channel_id, kind = ?channel.kind, "ignoring non-text channel");
            return;
        }
        Err(e) => {
            warn!(channel_id = %msg.channel_id, error = %e, "failed to resolve channel, dropping message");
            return;
        }
    }

    let prefix = bot.config().prefix.as_str();
    if let Some(invocation) = parse_invocation(&msg.content, prefix) {
        run_command(bot, conn, &msg, invocation);
        return;
    }

    if bot.config().acknowledge_messages && !msg.content.starts_with(prefix) {
        bot.notifier().react_success(conn, &msg);
    }

    bot.processors().run_message_create(bot, conn, &msg).await;
}

/// Start the command named by `invocation` without waiting for it.
fn run_command(bot: &Arc<Bot>, conn: &ConnectionRef, msg: &Message, invocation: Invocation<'_>) {
    let Some(command) = bot.commands().get(invocation.keyword) else {
        debug!(keyword = invocation.keyword, "not a command for us");
        return;
    };

    info!(
        shard = %conn.shard(),
        command = invocation.keyword,
        author = %msg.author.tag(),
        channel_id = %msg.channel_id,
        "running command"
    );

    let completion = command.run(
        conn.clone(),
        bot.clone(),
        msg.clone(),
        invocation.args.to_string(),
    );

    // Follow-up runs detached so the shard's event loop never waits on it.
    let bot = bot.clone();
    let conn = conn.clone();
    let msg = msg.clone();
    tokio::spawn(async move {
        if completion.wait().await {
            bot.processors().run_message_create(&bot, &conn, &msg).await;
        }
    });
}

// ---------------------------------------------------------------------------
// Guild and member handlers
// ---------------------------------------------------------------------------

pub fn on_guild_create(conn: &ConnectionRef, guild: &Guild) {
    info!(
        shard = %conn.shard(),
        guild_id = %guild.id,
        name = %guild.name,
        members = guild.member_count.unwrap_or_default(),
        "joined guild"
    );
}

pub fn on_guild_delete(conn: &ConnectionRef, guild: &UnavailableGuild) {
    if guild.unavailable {
        warn!(shard = %conn.shard(), guild_id = %guild.id, "guild became unavailable");
    } else {
        info!(shard = %conn.shard(), guild_id = %guild.id, "left guild");
    }
}

pub fn on_member_join(conn: &ConnectionRef, joined: &GuildMemberAdd) {
    let user = joined.member.user.as_ref().map(User::tag).unwrap_or_default();
    debug!(shard = %conn.shard(), guild_id = %joined.guild_id, %user, "member joined");
}

pub fn on_member_leave(conn: &ConnectionRef, left: &GuildMemberRemove) {
    debug!(
        shard = %conn.shard(),
        guild_id = %left.guild_id,
        user = %left.user.tag(),
        "member left"
    );
}
