use crate::documents::{self, ChatSummary, CreatedChat, DEFAULT_CHAT_TITLE};
use crate::error::ClientError;
use crate::router::ChannelRouter;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

/// The user's chats, as last fetched from the backend.
#[derive(Clone)]
pub struct ChatDirectory {
    router: ChannelRouter,
    chats: Arc<RwLock<Vec<ChatSummary>>>,
}

impl ChatDirectory {
    pub fn new(router: ChannelRouter) -> Self {
        Self {
            router,
            chats: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Cached list, most recently updated first.
    pub fn chats(&self) -> Vec<ChatSummary> {
        self.chats.read().clone()
    }

    pub fn get(&self, chat_id: Uuid) -> Option<ChatSummary> {
        self.chats
            .read()
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned()
    }

    pub async fn refresh(&self) -> Result<Vec<ChatSummary>, ClientError> {
        let response = self.router.execute(&documents::list_chats()).await?;
        let chats = documents::decode_chats(response)?;
        debug!(count = chats.len(), "chat list refreshed");
        *self.chats.write() = chats.clone();
        Ok(chats)
    }

    /// Create a chat (blank titles fall back to the default) and reload.
    pub async fn create(&self, title: &str, user_id: Uuid) -> Result<CreatedChat, ClientError> {
        let title = match title.trim() {
            "" => DEFAULT_CHAT_TITLE,
            trimmed => trimmed,
        };
        let response = self
            .router
            .execute(&documents::create_chat(title, user_id))
            .await?;
        let created = documents::decode_created_chat(response)?;
        info!(chat_id = %created.id, "chat created");
        self.refresh().await?;
        Ok(created)
    }

    /// Delete a chat with its messages and reload. Returns whether the
    /// backend had the chat.
    pub async fn delete(&self, chat_id: Uuid) -> Result<bool, ClientError> {
        let response = self
            .router
            .execute(&documents::delete_chat(chat_id))
            .await?;
        let deleted = documents::decode_deleted_chat(response)?.is_some();
        info!(%chat_id, deleted, "chat deleted");
        self.refresh().await?;
        Ok(deleted)
    }

    /// Refresh every `period`, starting immediately, until the stream is
    /// dropped. Failed refreshes are yielded and polling continues.
    pub fn poll(&self, period: Duration) -> BoxStream<'static, Result<Vec<ChatSummary>, ClientError>> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stream::unfold((self.clone(), ticker), |(directory, mut ticker)| async move {
            ticker.tick().await;
            let result = directory.refresh().await;
            Some((result, (directory, ticker)))
        })
        .boxed()
    }
}
