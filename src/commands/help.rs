use std::sync::Arc;

use tracing::warn;

use super::{Command, Completion};
use crate::bot::Bot;
use crate::transport::ConnectionRef;
use crate::types::Message;

/// Lists the usage of every registered command.
pub struct Help {
    usage: Vec<String>,
}

impl Help {
    pub fn new() -> Self {
        Self {
            usage: vec!["help - list available commands".to_string()],
        }
    }
}

impl Default for Help {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for Help {
    fn name(&self) -> &str {
        "help"
    }

    fn usage(&self) -> Vec<String> {
        self.usage.clone()
    }

    fn run(&self, conn: ConnectionRef, bot: Arc<Bot>, msg: Message, _args: String) -> Completion {
        Completion::spawn(async move {
            let text = help_text(&bot.config().prefix, &bot.commands().usages());
            if let Err(e) = conn.send_message(&msg.channel_id, &text).await {
                warn!(channel_id = %msg.channel_id, error = %e, "failed to send help");
            }
            false
        })
    }
}

fn help_text(prefix: &str, usages: &[String]) -> String {
    let mut text = format!("Commands (prefix `{}`):\n```\n", prefix);
    for line in usages {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("```");
    text
}
