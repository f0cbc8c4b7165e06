//! In-process backend speaking the same operations as the hosted one.

use super::{GraphQlResponse, ResponseStream, StreamingChannel, UnaryChannel};
use crate::auth::AuthHeaders;
use crate::conversation::{Message, MessageRole};
use crate::error::{ClientError, GraphQlError};
use crate::operation::Operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

/// Record of one unary call as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: String,
    pub headers: AuthHeaders,
}

struct MockChat {
    id: Uuid,
    title: String,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    chats: Vec<MockChat>,
    feeds: HashMap<Uuid, watch::Sender<Vec<Message>>>,
    required_token: Option<String>,
    unary_failures: VecDeque<ClientError>,
    subscribe_failures: VecDeque<ClientError>,
    calls: Vec<RecordedCall>,
}

struct Shared {
    state: Mutex<MockState>,
    reply_delay: Mutex<Option<Duration>>,
    active_streams: AtomicUsize,
    interrupts: watch::Sender<u64>,
}

/// Chats and messages held in memory, with a scripted assistant.
///
/// Implements both channel traits, so a router can run end to end without a
/// network. Subscriptions push the full message list on every change, the way
/// the hosted live query does.
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (interrupts, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState::default()),
                reply_delay: Mutex::new(Some(Duration::from_millis(20))),
                active_streams: AtomicUsize::new(0),
                interrupts,
            }),
        }
    }

    /// Delay before the assistant answers; `None` disables replies.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        *self.shared.reply_delay.lock() = delay;
    }

    /// Reject unary calls whose bearer token differs with `invalid-jwt`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.shared.state.lock().required_token = Some(token.into());
    }

    pub fn fail_next_unary(&self, err: ClientError) {
        self.shared.state.lock().unary_failures.push_back(err);
    }

    pub fn fail_next_subscribe(&self, err: ClientError) {
        self.shared.state.lock().subscribe_failures.push_back(err);
    }

    /// End every open subscription with `ConnectionLost`.
    pub fn drop_connections(&self) {
        self.shared.interrupts.send_modify(|epoch| *epoch += 1);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.shared.active_streams.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.state.lock().calls.clone()
    }

    pub fn seed_chat(&self, title: &str, user_id: Uuid) -> Uuid {
        let mut state = self.shared.state.lock();
        insert_chat(&mut state, title, user_id)
    }

    /// Insert a message as if another client or the assistant wrote it.
    pub fn push_message(&self, chat_id: Uuid, message: Message) {
        let mut state = self.shared.state.lock();
        append(&mut state, chat_id, message);
    }

    pub fn messages(&self, chat_id: Uuid) -> Vec<Message> {
        let state = self.shared.state.lock();
        state
            .feeds
            .get(&chat_id)
            .map(|feed| feed.borrow().clone())
            .unwrap_or_default()
    }

    fn handle(&self, operation: &Operation) -> Result<Value, ClientError> {
        match operation.name() {
            Some("GetChats") => Ok(self.list_chats()),
            Some("GetMessages") => {
                let chat_id = chat_id_var(operation, "chat_id")?;
                Ok(json!({ "messages": self.messages(chat_id) }))
            }
            Some("CreateChat") => {
                let title = string_var(operation, "title")?;
                let user_id = chat_id_var(operation, "user_id")?;
                let mut state = self.shared.state.lock();
                let id = insert_chat(&mut state, &title, user_id);
                let chat = state
                    .chats
                    .iter()
                    .find(|chat| chat.id == id)
                    .map(|chat| json!({ "id": chat.id, "title": chat.title, "created_at": chat.created_at }));
                Ok(json!({ "insert_chats_one": chat }))
            }
            Some("SendMessage") => {
                let chat_id = chat_id_var(operation, "chat_id")?;
                let content = string_var(operation, "message")?;
                let message = Message::new(MessageRole::User, content.clone());
                let id = message.id;
                {
                    let mut state = self.shared.state.lock();
                    if !state.chats.iter().any(|chat| chat.id == chat_id) {
                        return Err(ClientError::from_graphql(vec![GraphQlError::with_code(
                            "Foreign key violation. insert or update on table \"messages\"",
                            "constraint-violation",
                        )]));
                    }
                    append(&mut state, chat_id, message);
                }
                self.schedule_reply(chat_id, content);
                Ok(json!({
                    "insert_messages_one": { "id": id },
                    "sendMessage": { "message": "queued" }
                }))
            }
            Some("DeleteChat") => {
                let chat_id = chat_id_var(operation, "chat_id")?;
                let mut state = self.shared.state.lock();
                let affected = state
                    .feeds
                    .remove(&chat_id)
                    .map(|feed| {
                        let rows = feed.borrow().len();
                        rows
                    })
                    .unwrap_or_default();
                let before = state.chats.len();
                state.chats.retain(|chat| chat.id != chat_id);
                let deleted = (state.chats.len() != before).then(|| json!({ "id": chat_id }));
                Ok(json!({
                    "delete_messages": { "affected_rows": affected },
                    "delete_chats_by_pk": deleted
                }))
            }
            other => Err(ClientError::Validation(format!(
                "mock backend has no handler for {}",
                other.unwrap_or("anonymous operation")
            ))),
        }
    }

    fn list_chats(&self) -> Value {
        let state = self.shared.state.lock();
        let mut chats: Vec<&MockChat> = state.chats.iter().collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let rows: Vec<Value> = chats
            .into_iter()
            .map(|chat| {
                let preview: Vec<Value> = state
                    .feeds
                    .get(&chat.id)
                    .and_then(|feed| {
                        feed.borrow()
                            .last()
                            .map(|m| json!({ "content": m.content, "role": m.role }))
                    })
                    .into_iter()
                    .collect();
                json!({
                    "id": chat.id,
                    "title": chat.title,
                    "user_id": chat.user_id,
                    "created_at": chat.created_at,
                    "updated_at": chat.updated_at,
                    "messages": preview
                })
            })
            .collect();
        json!({ "chats": rows })
    }

    fn schedule_reply(&self, chat_id: Uuid, prompt: String) {
        let Some(delay) = *self.shared.reply_delay.lock() else {
            return;
        };
        let backend = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let reply = Message::new(MessageRole::Assistant, format!("[Mock] received '{prompt}'."));
            let mut state = backend.shared.state.lock();
            if state.chats.iter().any(|chat| chat.id == chat_id) {
                append(&mut state, chat_id, reply);
            }
        });
    }

    fn check_token(&self, headers: &AuthHeaders) -> Result<(), ClientError> {
        let state = self.shared.state.lock();
        let Some(required) = state.required_token.as_deref() else {
            return Ok(());
        };
        let presented = headers
            .get("Authorization")
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented == Some(required) {
            Ok(())
        } else {
            Err(ClientError::from_graphql(vec![GraphQlError::with_code(
                "Could not verify JWT: JWTExpired",
                "invalid-jwt",
            )]))
        }
    }
}

#[async_trait]
impl UnaryChannel for MockBackend {
    async fn execute(
        &self,
        operation: &Operation,
        headers: &AuthHeaders,
    ) -> Result<GraphQlResponse, ClientError> {
        let name = operation.name().unwrap_or("anonymous").to_string();
        debug!(operation = %name, "mock backend call");
        {
            let mut state = self.shared.state.lock();
            state.calls.push(RecordedCall {
                operation: name,
                headers: headers.clone(),
            });
            if let Some(err) = state.unary_failures.pop_front() {
                return Err(err);
            }
        }
        self.check_token(headers)?;
        self.handle(operation).map(GraphQlResponse::from_data)
    }
}

#[async_trait]
impl StreamingChannel for MockBackend {
    async fn subscribe(&self, operation: &Operation) -> Result<ResponseStream, ClientError> {
        if let Some(err) = self.shared.state.lock().subscribe_failures.pop_front() {
            return Err(err);
        }
        if operation.name() != Some("MessagesSubscription") {
            return Err(ClientError::Validation(format!(
                "mock backend cannot stream {}",
                operation.name().unwrap_or("anonymous operation")
            )));
        }
        let chat_id = chat_id_var(operation, "chat_id")?;
        let mut feed = {
            let mut state = self.shared.state.lock();
            feed_for(&mut state, chat_id).subscribe()
        };
        feed.mark_changed();
        let interrupts = self.shared.interrupts.subscribe();

        let guard = StreamGuard::new(self.shared.clone());
        let stream = futures::stream::unfold(
            Some((feed, interrupts, guard)),
            |state| async move {
                let (mut feed, mut interrupts, guard) = state?;
                tokio::select! {
                    changed = feed.changed() => match changed {
                        Ok(()) => {
                            let snapshot = feed.borrow_and_update().clone();
                            let item = Ok(GraphQlResponse::from_data(json!({ "messages": snapshot })));
                            Some((item, Some((feed, interrupts, guard))))
                        }
                        // Feed removed: the chat was deleted, complete the stream.
                        Err(_) => None,
                    },
                    _ = interrupts.changed() => {
                        let err = ClientError::ConnectionLost("mock connection dropped".to_string());
                        Some((Err(err), None))
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// Counts live subscription streams; decremented when the stream is dropped.
struct StreamGuard {
    shared: Arc<Shared>,
}

impl StreamGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.active_streams.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.shared.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

fn insert_chat(state: &mut MockState, title: &str, user_id: Uuid) -> Uuid {
    let now = Utc::now();
    let id = Uuid::new_v4();
    state.chats.push(MockChat {
        id,
        title: title.to_string(),
        user_id,
        created_at: now,
        updated_at: now,
    });
    feed_for(state, id);
    id
}

fn feed_for(state: &mut MockState, chat_id: Uuid) -> &watch::Sender<Vec<Message>> {
    state
        .feeds
        .entry(chat_id)
        .or_insert_with(|| watch::channel(Vec::new()).0)
}

fn append(state: &mut MockState, chat_id: Uuid, message: Message) {
    let created_at = message.created_at;
    feed_for(state, chat_id).send_modify(|messages| messages.push(message));
    if let Some(chat) = state.chats.iter_mut().find(|chat| chat.id == chat_id) {
        chat.updated_at = created_at;
    }
}

fn string_var(operation: &Operation, key: &str) -> Result<String, ClientError> {
    operation
        .variable(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Validation(format!("missing variable ${key}")))
}

fn chat_id_var(operation: &Operation, key: &str) -> Result<Uuid, ClientError> {
    let raw = string_var(operation, key)?;
    Uuid::parse_str(&raw).map_err(|_| {
        ClientError::from_graphql(vec![GraphQlError::with_code(
            format!("invalid input syntax for type uuid: \"{raw}\""),
            "validation-failed",
        )])
    })
}
