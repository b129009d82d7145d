//! Composition root: the shared dispatch core and the shard-owning runtime.
//!
//! [`Bot`] is what every handler, command and processor gets a reference
//! to: the frozen config, the command table, the processor sequences and
//! the notifier. Nothing in it is mutable, so shards dispatch into it
//! concurrently without locks.
//!
//! [`Runtime`] owns the shard set exclusively. It opens every shard at
//! start-up (all or nothing) and closes them in index order on shutdown.

use std::sync::Arc;

use tracing::{error, info, instrument, trace};

use crate::commands::CommandRegistry;
use crate::config::RuntimeConfig;
use crate::error::StartupError;
use crate::events::InboundEvent;
use crate::handlers;
use crate::notifier::Notifier;
use crate::processors::{InviteLinkFilter, Processors};
use crate::shard::ShardHandle;
use crate::transport::{ConnectionRef, ShardInfo, Transport};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Commands and processors to install, assembled before the runtime starts.
#[derive(Default, Clone)]
pub struct Registry {
    pub commands: CommandRegistry,
    pub processors: Processors,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `ping` and `help`, plus the invite-link filter on message create.
    pub fn standard(config: &RuntimeConfig) -> Self {
        let mut processors = Processors::new();
        processors.on_message(InviteLinkFilter::new(config.invite_filter.clone()));
        Self {
            commands: CommandRegistry::standard(),
            processors,
        }
    }
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

pub struct Bot {
    config: RuntimeConfig,
    commands: CommandRegistry,
    processors: Processors,
    notifier: Notifier,
}

impl Bot {
    pub fn new(config: RuntimeConfig, registry: Registry) -> Self {
        let notifier = Notifier::from_config(&config);
        Self {
            config,
            commands: registry.commands,
            processors: registry.processors,
            notifier,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn processors(&self) -> &Processors {
        &self.processors
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Route one event from the shard behind `conn` to its handler.
    ///
    /// Never fails: per-event errors are logged where they happen.
    pub async fn dispatch(self: &Arc<Self>, conn: &ConnectionRef, event: InboundEvent) {
        trace!(shard = %conn.shard(), event = %event.kind(), "dispatching");
        match event {
            InboundEvent::Ready(ready) => handlers::on_ready(conn, &ready),
            InboundEvent::MessageCreate(msg) => handlers::on_message(self, conn, msg).await,
            InboundEvent::MessageDelete(deleted) => {
                self.processors.run_message_delete(self, conn, &deleted).await;
            }
            InboundEvent::GuildCreate(guild) => handlers::on_guild_create(conn, &guild),
            InboundEvent::GuildDelete(guild) => handlers::on_guild_delete(conn, &guild),
            InboundEvent::MemberJoin(joined) => handlers::on_member_join(conn, &joined),
            InboundEvent::MemberLeave(left) => handlers::on_member_leave(conn, &left),
            InboundEvent::ReactionAdd(reaction) => {
                self.processors.run_reaction_add(self, conn, &reaction).await;
            }
            InboundEvent::ReactionRemove(reaction) => {
                self.processors.run_reaction_remove(self, conn, &reaction).await;
            }
        }
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("config", &self.config)
            .field("commands", &self.commands)
            .field("processors", &self.processors.counts())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// A running bot: every shard open and dispatching.
#[derive(Debug)]
pub struct Runtime {
    bot: Arc<Bot>,
    shards: Vec<ShardHandle>,
    stopped: bool,
}

impl Runtime {
    /// Open `config.shard_count` shards, in index order, all feeding one
    /// shared [`Bot`].
    ///
    /// If any shard fails to open, the ones already open are closed again and
    /// the error is returned; a partial runtime is never handed out.
    #[instrument(skip_all, fields(shards = config.shard_count))]
    pub async fn start(
        config: RuntimeConfig,
        transport: &dyn Transport,
        registry: Registry,
    ) -> Result<Self, StartupError> {
        let count = config.shard_count;
        let bot = Arc::new(Bot::new(config, registry));
        let (create, delete, react_add, react_remove) = bot.processors().counts();
        info!(
            commands = bot.commands().len(),
            message_create = create,
            message_delete = delete,
            reaction_add = react_add,
            reaction_remove = react_remove,
            "registries frozen, opening shards"
        );

        let mut shards = Vec::with_capacity(count as usize);
        for index in 0..count {
            let info = ShardInfo::new(index, count);
            let mut shard = ShardHandle::new(info);
            match shard.open(transport, bot.clone()).await {
                Ok(()) => shards.push(shard),
                Err(source) => {
                    error!(shard = %info, error = %source, "shard failed to open, aborting start-up");
                    for shard in &mut shards {
                        shard.close().await;
                    }
                    return Err(StartupError::ShardOpen {
                        index,
                        count,
                        source,
                    });
                }
            }
        }

        info!(shards = shards.len(), "runtime started");
        Ok(Self {
            bot,
            shards,
            stopped: false,
        })
    }

    pub fn bot(&self) -> &Arc<Bot> {
        &self.bot
    }

    pub fn shards(&self) -> &[ShardHandle] {
        &self.shards
    }

    /// Close every shard in ascending index order. Each close waits for the
    /// transport to confirm. Calling this again is a no-op.
    ///
    /// Command work already spawned keeps running.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!(shards = self.shards.len(), "shutting down");
        for shard in &mut self.shards {
            shard.close().await;
        }
        info!("all shards closed");
    }
}
