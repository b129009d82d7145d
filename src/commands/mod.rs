//! Explicitly invoked commands (`<prefix> <keyword> [args]`).
//!
//! A [`Command`] is resolved by keyword from the [`CommandRegistry`] and run
//! with the raw argument text. `run` never blocks the caller: it spawns its
//! own work and hands back a [`Completion`] that resolves when that work is
//! done. Callers that drop the completion must not assume the side effect
//! has happened by the time the event loop moves on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::bot::Bot;
use crate::error::StartupError;
use crate::transport::ConnectionRef;
use crate::types::Message;

pub mod help;
pub mod ping;

pub use help::Help;
pub use ping::Ping;

/// Single-resolution completion signal for a command's spawned work.
///
/// Resolves to `true` when the message-create processor chain should also run
/// for the triggering message.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<bool>);

impl Completion {
    /// Run `work` on its own task and resolve with its output.
    pub fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // The receiver may already be gone; fire-and-forget callers drop it.
            let _ = tx.send(work.await);
        });
        Self(rx)
    }

    /// An already-resolved completion, for commands with nothing to do.
    pub fn ready(value: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self(rx)
    }

    /// Wait for the command's work. A task that died before signalling counts
    /// as `false`.
    pub async fn wait(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}

/// A named unit of work invoked by explicit user request.
pub trait Command: Send + Sync {
    /// Invocation keyword, unique within a registry.
    fn name(&self) -> &str;

    /// Human-readable usage lines. Pure.
    fn usage(&self) -> Vec<String>;

    /// Start the command. `args` is everything after the keyword, verbatim.
    ///
    /// Side-effect failures are logged and swallowed; the completion always
    /// resolves.
    fn run(&self, conn: ConnectionRef, bot: Arc<Bot>, msg: Message, args: String) -> Completion;
}

/// Keyword → command mapping, frozen once the runtime starts.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in commands: `ping` and `help`.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.commands.insert("ping".into(), Arc::new(Ping::new()));
        registry.commands.insert("help".into(), Arc::new(Help::new()));
        registry
    }

    pub fn register(&mut self, command: impl Command + 'static) -> Result<(), StartupError> {
        let name = command.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(StartupError::DuplicateCommand(name));
        }
        self.commands.insert(name, Arc::new(command));
        Ok(())
    }

    pub fn get(&self, keyword: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(keyword)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Usage lines of every command, ordered by keyword.
    pub fn usages(&self) -> Vec<String> {
        let mut names: Vec<&String> = self.commands.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| self.commands[name].usage())
            .collect()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_completion_resolves_with_work_output() {
        let completion = Completion::spawn(async { true });
        assert!(completion.wait().await);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_false() {
        let (tx, rx) = oneshot::channel::<bool>();
        drop(tx);
        assert!(!Completion(rx).wait().await);
    }

    #[tokio::test]
    async fn ready_completion_is_immediate() {
        assert!(Completion::ready(true).wait().await);
        assert!(!Completion::ready(false).wait().await);
    }

    #[test]
    fn duplicate_keyword_is_rejected() {
        let mut registry = CommandRegistry::standard();
        let err = registry.register(Ping::new()).unwrap_err();
        assert!(matches!(err, StartupError::DuplicateCommand(name) if name == "ping"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn usages_are_ordered_by_keyword() {
        let registry = CommandRegistry::standard();
        let usages = registry.usages();
        assert_eq!(usages.first().map(String::as_str), Some("help - list available commands"));
        assert_eq!(usages.last().map(String::as_str), Some("ping - pong"));
    }

    #[test]
    fn unknown_keyword_resolves_to_nothing() {
        assert!(CommandRegistry::standard().get("ban").is_none());
    }
}
