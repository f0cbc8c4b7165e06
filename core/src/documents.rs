//! GraphQL documents the client issues, with typed builders and decoders.

use crate::conversation::{Message, MessageRole};
use crate::error::ClientError;
use crate::operation::{Operation, OperationKind};
use crate::transport::GraphQlResponse;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const GET_CHATS: &str = r#"
  query GetChats {
    chats(order_by: { updated_at: desc }) {
      id
      title
      created_at
      updated_at
      messages(limit: 1, order_by: { created_at: desc }) {
        content
        role
      }
    }
  }
"#;

pub const GET_MESSAGES: &str = r#"
  query GetMessages($chat_id: uuid!) {
    messages(where: { chat_id: { _eq: $chat_id } }, order_by: { created_at: asc }) {
      id
      content
      role
      created_at
    }
  }
"#;

pub const CREATE_CHAT: &str = r#"
  mutation CreateChat($title: String!, $user_id: uuid!) {
    insert_chats_one(object: { title: $title, user_id: $user_id }) {
      id
      title
      created_at
    }
  }
"#;

pub const SEND_MESSAGE: &str = r#"
  mutation SendMessage($message: String!, $chat_id: uuid!) {
    insert_messages_one(object: { content: $message, role: "user", chat_id: $chat_id }) {
      id
    }
    sendMessage(message: $message, chat_id: $chat_id) {
      message
    }
  }
"#;

pub const MESSAGES_SUBSCRIPTION: &str = r#"
  subscription MessagesSubscription($chat_id: uuid!) {
    messages(where: { chat_id: { _eq: $chat_id } }, order_by: { created_at: asc }) {
      id
      content
      role
      created_at
    }
  }
"#;

pub const DELETE_CHAT: &str = r#"
  mutation DeleteChat($chat_id: uuid!) {
    delete_messages(where: { chat_id: { _eq: $chat_id } }) {
      affected_rows
    }
    delete_chats_by_pk(id: $chat_id) {
      id
    }
  }
"#;

/// Title given to chats created from the sidebar.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

pub fn list_chats() -> Operation {
    Operation::new(OperationKind::Query, GET_CHATS)
}

pub fn chat_messages(chat_id: Uuid) -> Operation {
    Operation::new(OperationKind::Query, GET_MESSAGES).with_variable("chat_id", chat_id.to_string())
}

pub fn create_chat(title: &str, user_id: Uuid) -> Operation {
    Operation::new(OperationKind::Mutation, CREATE_CHAT)
        .with_variable("title", title)
        .with_variable("user_id", user_id.to_string())
}

pub fn send_message(chat_id: Uuid, content: &str) -> Operation {
    Operation::new(OperationKind::Mutation, SEND_MESSAGE)
        .with_variable("message", content)
        .with_variable("chat_id", chat_id.to_string())
}

pub fn subscribe_messages(chat_id: Uuid) -> Operation {
    Operation::new(OperationKind::Subscription, MESSAGES_SUBSCRIPTION)
        .with_variable("chat_id", chat_id.to_string())
}

pub fn delete_chat(chat_id: Uuid) -> Operation {
    Operation::new(OperationKind::Mutation, DELETE_CHAT)
        .with_variable("chat_id", chat_id.to_string())
}

/// Sidebar entry: a chat plus a preview of its latest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<MessagePreview>,
}

impl ChatSummary {
    pub fn last_message(&self) -> Option<&MessagePreview> {
        self.messages.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePreview {
    pub content: String,
    pub role: MessageRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatedChat {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ChatsData {
    chats: Vec<ChatSummary>,
}

#[derive(Deserialize)]
struct MessagesData {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct CreateChatData {
    insert_chats_one: Option<CreatedChat>,
}

#[derive(Deserialize)]
struct DeleteChatData {
    delete_chats_by_pk: Option<IdOnly>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: Uuid,
}

pub fn decode_chats(response: GraphQlResponse) -> Result<Vec<ChatSummary>, ClientError> {
    decode_data::<ChatsData>(response).map(|data| data.chats)
}

/// Works for both `GetMessages` and every `MessagesSubscription` push.
pub fn decode_messages(response: GraphQlResponse) -> Result<Vec<Message>, ClientError> {
    decode_data::<MessagesData>(response).map(|data| data.messages)
}

pub fn decode_created_chat(response: GraphQlResponse) -> Result<CreatedChat, ClientError> {
    decode_data::<CreateChatData>(response)?
        .insert_chats_one
        .ok_or_else(|| ClientError::Decode("insert_chats_one returned null".to_string()))
}

/// Id of the deleted chat, or `None` if it no longer existed.
pub fn decode_deleted_chat(response: GraphQlResponse) -> Result<Option<Uuid>, ClientError> {
    decode_data::<DeleteChatData>(response).map(|data| data.delete_chats_by_pk.map(|row| row.id))
}

fn decode_data<T: DeserializeOwned>(response: GraphQlResponse) -> Result<T, ClientError> {
    let data = response.into_data()?;
    serde_json::from_value(data).map_err(|err| ClientError::Decode(err.to_string()))
}
