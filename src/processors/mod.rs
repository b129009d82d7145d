//! Passive processors run on every qualifying event.
//!
//! There is one trait per event kind and one ordered sequence per kind in
//! [`Processors`]. Registration order is execution order. Only message-create
//! processors can stop their chain, by returning `true`.
//!
//! The gateway may redeliver recent events after a resume, so processors must
//! tolerate seeing the same event id twice.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bot::Bot;
use crate::transport::ConnectionRef;
use crate::types::{Message, MessageDelete, MessageReaction};

pub mod invite_link;

pub use invite_link::InviteLinkFilter;

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `true` when the message is fully handled and later processors
    /// must not run.
    async fn on_message(&self, bot: &Bot, conn: &ConnectionRef, msg: &Message) -> bool;
}

#[async_trait]
pub trait MessageDeleteProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_message_delete(&self, bot: &Bot, conn: &ConnectionRef, event: &MessageDelete);
}

#[async_trait]
pub trait ReactionAddProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_reaction_add(&self, bot: &Bot, conn: &ConnectionRef, event: &MessageReaction);
}

#[async_trait]
pub trait ReactionRemoveProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_reaction_remove(&self, bot: &Bot, conn: &ConnectionRef, event: &MessageReaction);
}

/// The four processor sequences. Read-only once the runtime starts.
#[derive(Default, Clone)]
pub struct Processors {
    message_create: Vec<Arc<dyn MessageProcessor>>,
    message_delete: Vec<Arc<dyn MessageDeleteProcessor>>,
    reaction_add: Vec<Arc<dyn ReactionAddProcessor>>,
    reaction_remove: Vec<Arc<dyn ReactionRemoveProcessor>>,
}

impl Processors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&mut self, processor: impl MessageProcessor + 'static) -> &mut Self {
        self.message_create.push(Arc::new(processor));
        self
    }

    pub fn on_message_delete(
        &mut self,
        processor: impl MessageDeleteProcessor + 'static,
    ) -> &mut Self {
        self.message_delete.push(Arc::new(processor));
        self
    }

    pub fn on_reaction_add(&mut self, processor: impl ReactionAddProcessor + 'static) -> &mut Self {
        self.reaction_add.push(Arc::new(processor));
        self
    }

    pub fn on_reaction_remove(
        &mut self,
        processor: impl ReactionRemoveProcessor + 'static,
    ) -> &mut Self {
        self.reaction_remove.push(Arc::new(processor));
        self
    }

    /// Run the message-create chain, stopping at the first processor that
    /// reports the message handled. Returns that processor's name.
    pub async fn run_message_create(
        &self,
        bot: &Bot,
        conn: &ConnectionRef,
        msg: &Message,
    ) -> Option<String> {
        for processor in &self.message_create {
            if processor.on_message(bot, conn, msg).await {
                debug!(
                    processor = processor.name(),
                    message_id = %msg.id,
                    "message handled, stopping chain"
                );
                return Some(processor.name().to_string());
            }
        }
        None
    }

    pub async fn run_message_delete(&self, bot: &Bot, conn: &ConnectionRef, event: &MessageDelete) {
        for processor in &self.message_delete {
            processor.on_message_delete(bot, conn, event).await;
        }
    }

    pub async fn run_reaction_add(&self, bot: &Bot, conn: &ConnectionRef, event: &MessageReaction) {
        for processor in &self.reaction_add {
            processor.on_reaction_add(bot, conn, event).await;
        }
    }

    pub async fn run_reaction_remove(
        &self,
        bot: &Bot,
        conn: &ConnectionRef,
        event: &MessageReaction,
    ) {
        for processor in &self.reaction_remove {
            processor.on_reaction_remove(bot, conn, event).await;
        }
    }

    /// `(message_create, message_delete, reaction_add, reaction_remove)` counts.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.message_create.len(),
            self.message_delete.len(),
            self.reaction_add.len(),
            self.reaction_remove.len(),
        )
    }
}
