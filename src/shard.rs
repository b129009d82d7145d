//! One gateway shard as the runtime sees it.
//!
//! A [`ShardHandle`] owns the shard's connection and the task that pumps its
//! events into [`Bot::dispatch`]. Events from one shard are dispatched one at
//! a time, in delivery order; different shards run concurrently.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bot::Bot;
use crate::error::TransportError;
use crate::transport::{ConnectionRef, EventStream, ShardInfo, Transport};

/// `Unopened -> Connecting -> Ready -> Closed`, or `Connecting -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Unopened,
    Connecting,
    Ready,
    Closed,
    Failed,
}

pub struct ShardHandle {
    info: ShardInfo,
    state: ShardState,
    conn: Option<ConnectionRef>,
    stop: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ShardHandle {
    /// An unopened slot for `info`.
    pub fn new(info: ShardInfo) -> Self {
        Self {
            info,
            state: ShardState::Unopened,
            conn: None,
            stop: None,
            pump: None,
        }
    }

    /// Open the slot on `transport` and start feeding its events to `bot`.
    ///
    /// Resolves once the transport reports the shard ready. On error the slot
    /// stays [`ShardState::Failed`].
    pub async fn open(&mut self, transport: &dyn Transport, bot: Arc<Bot>) -> Result<(), TransportError> {
        if self.state != ShardState::Unopened {
            return Err(TransportError::Gateway(format!(
                "shard {} cannot be opened from {:?}",
                self.info, self.state
            )));
        }
        self.transition(ShardState::Connecting);

        let (conn, events) = match transport.open(self.info).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(shard = %self.info, error = %e, "shard failed to open");
                self.transition(ShardState::Failed);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        self.pump = Some(tokio::spawn(pump(self.info, conn.clone(), events, bot, stop_rx)));
        self.stop = Some(stop_tx);
        self.conn = Some(conn);
        self.transition(ShardState::Ready);
        Ok(())
    }

    pub fn info(&self) -> ShardInfo {
        self.info
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    /// The open connection, once the shard has been Ready.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        self.conn.as_ref()
    }

    /// Stop dispatching, close the connection and wait for the pump to
    /// finish the event it is on. Only acts on a Ready shard.
    pub async fn close(&mut self) {
        if self.state != ShardState::Ready {
            debug!(shard = %self.info, state = ?self.state, "close ignored");
            return;
        }

        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(conn) = &self.conn {
            conn.close().await;
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(shard = %self.info, error = %e, "event pump ended abnormally");
            }
        }
        self.transition(ShardState::Closed);
    }

    fn transition(&mut self, next: ShardState) {
        debug!(shard = %self.info, from = ?self.state, to = ?next, "shard state change");
        if next == ShardState::Ready {
            info!(shard = %self.info, "shard ready");
        }
        self.state = next;
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("info", &self.info)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn pump(
    info: ShardInfo,
    conn: ConnectionRef,
    mut events: EventStream,
    bot: Arc<Bot>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                debug!(shard = %info, "event pump stopped");
                return;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!(shard = %info, "event stream ended");
                    return;
                };

                // One task per event: a panicking handler ends only that task.
                let kind = event.kind();
                let bot = bot.clone();
                let conn = conn.clone();
                let handled = tokio::spawn(async move { bot.dispatch(&conn, event).await });
                if let Err(e) = handled.await {
                    error!(shard = %info, event = %kind, error = %e, "event handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bot::Registry;
    use crate::config::RuntimeConfig;
    use crate::events::InboundEvent;
    use crate::processors::MessageProcessor;
    use crate::testing::*;
    use crate::types::Message;

    fn bot() -> Arc<Bot> {
        let config = RuntimeConfig::default();
        Arc::new(Bot::new(config.clone(), Registry::standard(&config)))
    }

    /// Records every message it sees and panics on the content "boom".
    struct Fragile {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageProcessor for Fragile {
        fn name(&self) -> &str {
            "fragile"
        }

        async fn on_message(&self, _bot: &Bot, _conn: &ConnectionRef, msg: &Message) -> bool {
            self.seen.lock().unwrap().push(msg.content.clone());
            if msg.content == "boom" {
                panic!("processor blew up");
            }
            false
        }
    }

    #[tokio::test]
    async fn open_failure_leaves_slot_failed() {
        let transport = MockTransport::new(Recorder::default()).fail_at(0);
        let mut shard = ShardHandle::new(ShardInfo::new(0, 1));
        assert_eq!(shard.state(), ShardState::Unopened);

        let err = shard.open(&transport, bot()).await.unwrap_err();

        assert!(matches!(err, TransportError::AuthenticationFailed));
        assert_eq!(shard.state(), ShardState::Failed);
        assert!(shard.connection().is_none());
    }

    #[tokio::test]
    async fn failed_slot_cannot_be_reopened_or_closed() {
        let recorder = Recorder::default();
        let transport = MockTransport::new(recorder.clone()).fail_at(0);
        let mut shard = ShardHandle::new(ShardInfo::new(0, 1));
        let _ = shard.open(&transport, bot()).await;

        assert!(shard.open(&transport, bot()).await.is_err());
        shard.close().await;

        assert_eq!(shard.state(), ShardState::Failed);
        assert_eq!(recorder.calls(), vec![Call::Open(0)]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let recorder = Recorder::default();
        let transport = MockTransport::new(recorder.clone());
        let mut shard = ShardHandle::new(ShardInfo::new(0, 1));
        shard.open(&transport, bot()).await.unwrap();
        assert_eq!(shard.state(), ShardState::Ready);

        shard.close().await;
        shard.close().await;

        assert_eq!(shard.state(), ShardState::Closed);
        assert_eq!(recorder.calls(), vec![Call::Open(0), Call::Close(0)]);
    }

    #[tokio::test]
    async fn pump_dispatches_delivered_events() {
        let recorder = Recorder::default();
        let transport = MockTransport::new(recorder.clone());
        let mut shard = ShardHandle::new(ShardInfo::new(0, 1));
        shard.open(&transport, bot()).await.unwrap();

        transport
            .sender(0)
            .send(InboundEvent::MessageCreate(message("hello world")))
            .await
            .unwrap();

        let calls = recorder
            .wait_until(|calls| calls.iter().any(|c| matches!(c, Call::React { .. })))
            .await;
        assert!(calls.iter().any(|c| matches!(c, Call::React { .. })));

        shard.close().await;
    }

    #[tokio::test]
    async fn panicking_processor_does_not_stop_the_shard() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = Registry::empty();
        registry.processors.on_message(Fragile { seen: seen.clone() });
        let bot = Arc::new(Bot::new(RuntimeConfig::default(), registry));

        let recorder = Recorder::default();
        let transport = MockTransport::new(recorder.clone());
        let mut shard = ShardHandle::new(ShardInfo::new(0, 1));
        shard.open(&transport, bot).await.unwrap();

        let sender = transport.sender(0);
        sender
            .send(InboundEvent::MessageCreate(message("boom")))
            .await
            .unwrap();
        sender
            .send(InboundEvent::MessageCreate(message("still here")))
            .await
            .unwrap();

        for _ in 0..200 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["boom".to_string(), "still here".to_string()]
        );
        assert_eq!(shard.state(), ShardState::Ready);

        shard.close().await;
        assert_eq!(shard.state(), ShardState::Closed);
    }
}
