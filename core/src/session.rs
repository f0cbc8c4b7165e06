use crate::conversation::{ConversationState, Message, OpenOutcome, Phase};
use crate::documents;
use crate::error::ClientError;
use crate::router::ChannelRouter;
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Something the view should re-render for.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// First payload arrived; the view left its loading state.
    Live,
    /// New messages were appended.
    Messages(usize),
    /// The connection dropped and the subscription was requested again.
    Resubscribing,
    /// The typing indicator ran past its deadline.
    TypingExpired,
    /// The server completed the subscription.
    Ended,
    Error(ClientError),
}

enum StreamEvent {
    Snapshot(Result<Vec<Message>, ClientError>),
    Ended,
}

struct Tagged {
    generation: u64,
    event: StreamEvent,
}

/// The subscription task for the open chat. Once the aborted task has been
/// awaited its stream is gone and the cancel has reached the channel.
struct ActiveSubscription {
    chat_id: Uuid,
    task: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drives the message view: one conversation, at most one subscription.
///
/// Everything here runs on the caller's event loop. Subscription events
/// arrive through a channel and are applied in `next_update` / `drain`;
/// events tagged with an older generation belong to a torn-down
/// subscription and are dropped.
pub struct ChatSession {
    router: ChannelRouter,
    state: ConversationState,
    events_tx: UnboundedSender<Tagged>,
    events_rx: UnboundedReceiver<Tagged>,
    active: Option<ActiveSubscription>,
    generation: u64,
    resubscribed: bool,
}

impl ChatSession {
    pub fn new(router: ChannelRouter) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            router,
            state: ConversationState::new(),
            events_tx,
            events_rx,
            active: None,
            generation: 0,
            resubscribed: false,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    pub fn chat_id(&self) -> Option<Uuid> {
        self.state.chat_id()
    }

    pub fn input(&self) -> &str {
        self.state.input()
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.state.set_input(input);
    }

    pub fn is_typing(&self) -> bool {
        self.state.is_typing(Instant::now())
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.state.error()
    }

    pub fn has_subscription(&self) -> bool {
        self.active.is_some()
    }

    /// Switch the view to `chat_id`, replacing any other chat's subscription.
    ///
    /// The previous subscription is fully cancelled before the new one is
    /// requested, so the server sees `complete` for the old chat first.
    pub async fn open_chat(&mut self, chat_id: Uuid) {
        match self.state.open(chat_id) {
            OpenOutcome::AlreadyOpen => {}
            OpenOutcome::Opened { previous } => {
                if let Some(previous) = previous {
                    debug!(%previous, "tearing down previous chat subscription");
                }
                self.teardown().await;
                self.resubscribed = false;
                info!(%chat_id, "opening chat");
                self.spawn_subscription(chat_id);
            }
        }
    }

    /// Deselect the chat and forget its messages.
    pub async fn close_chat(&mut self) {
        self.teardown().await;
        self.state.close();
    }

    /// Close the view if `chat_id` was just deleted.
    pub async fn chat_deleted(&mut self, chat_id: Uuid) {
        if self.state.chat_id() == Some(chat_id) {
            self.close_chat().await;
        }
    }

    /// Send `content` to the open chat.
    ///
    /// The draft is cleared and the typing indicator raised before the
    /// mutation goes out. On failure the draft is restored, the indicator is
    /// dropped at once and the error is returned. Nothing is appended here;
    /// the message shows up when the subscription delivers it.
    pub async fn send_local(&mut self, content: &str) -> Result<(), ClientError> {
        let Some(chat_id) = self.state.chat_id() else {
            return Err(ClientError::Validation("no chat selected".to_string()));
        };
        if !self.state.begin_send(content, Instant::now()) {
            return Ok(());
        }
        let operation = documents::send_message(chat_id, content);
        match self.router.execute(&operation).await {
            Ok(_) => {
                self.state.send_succeeded();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, %chat_id, "failed to send message");
                self.state.send_failed(content.to_string(), err.clone());
                Err(err)
            }
        }
    }

    /// Send whatever is in the draft.
    pub async fn submit(&mut self) -> Result<(), ClientError> {
        let content = self.state.input().to_string();
        self.send_local(&content).await
    }

    /// Wait for the next change worth rendering.
    ///
    /// Cancel-safe: dropping the future loses no events.
    pub async fn next_update(&mut self) -> SessionUpdate {
        loop {
            let deadline = self.state.typing_deadline();
            tokio::select! {
                Some(tagged) = self.events_rx.recv() => {
                    if let Some(update) = self.apply(tagged) {
                        return update;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.state.expire_typing(Instant::now()) {
                        return SessionUpdate::TypingExpired;
                    }
                }
            }
        }
    }

    /// Apply everything already queued without waiting.
    pub fn drain(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(tagged) = self.events_rx.try_recv() {
            if let Some(update) = self.apply(tagged) {
                updates.push(update);
            }
        }
        if self.state.expire_typing(Instant::now()) {
            updates.push(SessionUpdate::TypingExpired);
        }
        updates
    }

    /// Cancel the subscription and wait until its task is gone.
    async fn teardown(&mut self) {
        self.generation += 1;
        if let Some(mut active) = self.active.take() {
            debug!(chat_id = %active.chat_id, "cancelling subscription");
            active.task.abort();
            let _ = (&mut active.task).await;
        }
    }

    /// Forget the current subscription without waiting for it. Anything it
    /// still queues is stale.
    fn discard(&mut self) {
        self.generation += 1;
        self.active = None;
    }

    fn spawn_subscription(&mut self, chat_id: Uuid) {
        let generation = self.generation;
        let router = self.router.clone();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let operation = documents::subscribe_messages(chat_id);
            let mut stream = match router.subscribe(&operation).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events.send(Tagged {
                        generation,
                        event: StreamEvent::Snapshot(Err(err)),
                    });
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                let snapshot = item.and_then(documents::decode_messages);
                let event = StreamEvent::Snapshot(snapshot);
                if events.send(Tagged { generation, event }).is_err() {
                    return;
                }
            }
            let _ = events.send(Tagged {
                generation,
                event: StreamEvent::Ended,
            });
        });
        self.active = Some(ActiveSubscription { chat_id, task });
    }

    fn apply(&mut self, tagged: Tagged) -> Option<SessionUpdate> {
        if tagged.generation != self.generation {
            return None;
        }
        match tagged.event {
            StreamEvent::Snapshot(Ok(snapshot)) => {
                self.resubscribed = false;
                let was_loading = self.state.phase() == Phase::Loading;
                self.state.mark_live();
                let appended = self.state.apply_snapshot(snapshot);
                if was_loading && appended == 0 {
                    Some(SessionUpdate::Live)
                } else if appended > 0 {
                    Some(SessionUpdate::Messages(appended))
                } else {
                    None
                }
            }
            StreamEvent::Snapshot(Err(ClientError::ConnectionLost(reason))) if !self.resubscribed => {
                let chat_id = self.state.chat_id()?;
                warn!(%reason, %chat_id, "subscription lost, subscribing again");
                // The stream already ended, so there is nothing to cancel.
                self.discard();
                self.resubscribed = true;
                self.state.resubscribing();
                self.spawn_subscription(chat_id);
                Some(SessionUpdate::Resubscribing)
            }
            StreamEvent::Snapshot(Err(err)) => {
                self.discard();
                self.state.set_error(err.clone());
                Some(SessionUpdate::Error(err))
            }
            StreamEvent::Ended => {
                self.discard();
                Some(SessionUpdate::Ended)
            }
        }
    }
}
