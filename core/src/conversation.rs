use crate::error::ClientError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How long the typing indicator stays up without an assistant reply.
pub const TYPING_TIMEOUT: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of the message view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No chat selected yet.
    Idle,
    /// Subscription requested, nothing received.
    Loading,
    /// Subscription delivering messages.
    Live,
    /// Subscription torn down; a new open goes back to `Loading`.
    Closed,
}

/// One chat's messages in arrival order, plus the typing indicator.
#[derive(Debug, Clone)]
pub struct Conversation {
    chat_id: Uuid,
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
    typing_deadline: Option<Instant>,
}

impl Conversation {
    pub fn new(chat_id: Uuid) -> Self {
        Self {
            chat_id,
            messages: Vec::new(),
            seen: HashSet::new(),
            typing_deadline: None,
        }
    }

    pub fn chat_id(&self) -> Uuid {
        self.chat_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.seen.contains(&id)
    }

    /// Append unless the id is already present. Any assistant message drops
    /// the typing indicator, duplicate or not.
    pub fn receive(&mut self, message: Message) -> bool {
        if message.role == MessageRole::Assistant {
            self.typing_deadline = None;
        }
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn start_typing(&mut self, now: Instant) {
        self.typing_deadline = Some(now + TYPING_TIMEOUT);
    }

    pub fn clear_typing(&mut self) {
        self.typing_deadline = None;
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing_deadline.is_some_and(|deadline| now < deadline)
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing_deadline
    }
}

/// Whether `open` replaced the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    AlreadyOpen,
    Opened { previous: Option<Uuid> },
}

/// Plain state behind the message view: phase, open conversation, draft
/// input and the last surfaced error.
#[derive(Debug, Clone)]
pub struct ConversationState {
    phase: Phase,
    conversation: Option<Conversation>,
    input: String,
    error: Option<ClientError>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            conversation: None,
            input: String::new(),
            error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn chat_id(&self) -> Option<Uuid> {
        self.conversation.as_ref().map(Conversation::chat_id)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(Conversation::messages)
            .unwrap_or_default()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, err: ClientError) {
        self.error = Some(err);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|conversation| conversation.is_typing(now))
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.conversation
            .as_ref()
            .and_then(Conversation::typing_deadline)
    }

    /// Select a chat. Re-selecting the open chat keeps its state.
    pub fn open(&mut self, chat_id: Uuid) -> OpenOutcome {
        let active = matches!(self.phase, Phase::Loading | Phase::Live);
        if active && self.chat_id() == Some(chat_id) {
            return OpenOutcome::AlreadyOpen;
        }
        let previous = self.chat_id();
        self.conversation = Some(Conversation::new(chat_id));
        self.phase = Phase::Loading;
        self.error = None;
        OpenOutcome::Opened { previous }
    }

    /// Back to `Loading` for a re-issued subscription, keeping messages.
    pub fn resubscribing(&mut self) {
        if self.conversation.is_some() {
            self.phase = Phase::Loading;
        }
    }

    pub fn mark_live(&mut self) {
        if self.phase == Phase::Loading {
            self.phase = Phase::Live;
        }
    }

    pub fn receive(&mut self, message: Message) -> bool {
        match self.conversation.as_mut() {
            Some(conversation) => conversation.receive(message),
            None => false,
        }
    }

    /// Feed a full server snapshot; only ids not seen before are received.
    /// Returns how many messages were appended.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Message>) -> usize {
        let Some(conversation) = self.conversation.as_mut() else {
            return 0;
        };
        let mut appended = 0;
        for message in snapshot {
            if !conversation.contains(message.id) && conversation.receive(message) {
                appended += 1;
            }
        }
        appended
    }

    /// Clear the draft and raise the typing indicator for `content`.
    ///
    /// Returns `false` when there is nothing to send.
    pub fn begin_send(&mut self, content: &str, now: Instant) -> bool {
        if content.trim().is_empty() {
            return false;
        }
        let Some(conversation) = self.conversation.as_mut() else {
            return false;
        };
        self.input.clear();
        conversation.start_typing(now);
        true
    }

    pub fn send_succeeded(&mut self) {
        self.error = None;
    }

    /// Put the draft back and drop the typing indicator right away.
    pub fn send_failed(&mut self, content: String, err: ClientError) {
        self.input = content;
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.clear_typing();
        }
        self.error = Some(err);
    }

    /// Drop the typing indicator once its deadline passed. Returns whether it
    /// changed.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        match self.conversation.as_mut() {
            Some(conversation)
                if conversation
                    .typing_deadline()
                    .is_some_and(|deadline| now >= deadline) =>
            {
                conversation.clear_typing();
                true
            }
            _ => false,
        }
    }

    /// Deselect the chat and forget its messages.
    pub fn close(&mut self) {
        if self.phase == Phase::Idle && self.conversation.is_none() {
            return;
        }
        self.conversation = None;
        self.phase = Phase::Closed;
    }
}
