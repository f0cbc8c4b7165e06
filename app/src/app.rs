use crate::render;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use parley_core::auth::{AuthState, SessionCredentials};
use parley_core::config::{BackendKind, ClientSettings};
use parley_core::documents::ChatSummary;
use parley_core::{ChannelRouter, ChatDirectory, ChatSession, MockBackend, SessionUpdate};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};
use uuid::Uuid;

/// Lines typed during a conversation that are not messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Send(String),
    /// Send the draft kept from the last failed send.
    Retry,
    Delete,
    Quit,
    Empty,
}

impl ChatCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            "/quit" | "/exit" => Self::Quit,
            "/retry" => Self::Retry,
            "/delete" => Self::Delete,
            _ => Self::Send(line.trim_end().to_string()),
        }
    }
}

/// How a conversation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    InputClosed,
    SignedOut,
    ChatDeleted,
    ServerEnded,
}

/// Wires settings, credentials, the router, the chat list and the message
/// view together for the terminal front-end.
pub struct ParleyApp {
    credentials: SessionCredentials,
    directory: ChatDirectory,
    session: ChatSession,
    settings: ClientSettings,
    mock: Option<MockBackend>,
}

impl ParleyApp {
    pub fn from_settings(settings: ClientSettings) -> Result<Self> {
        let credentials = match settings.access_token.as_deref() {
            Some(token) => SessionCredentials::with_token(token),
            None => SessionCredentials::new(AuthState::signed_out()),
        };
        let provider = Arc::new(credentials.clone());
        let (router, mock) = match settings.backend {
            BackendKind::Mock => {
                let backend = MockBackend::new();
                (ChannelRouter::mock(backend.clone(), provider), Some(backend))
            }
            BackendKind::Nhost => {
                let endpoints = settings
                    .endpoints
                    .as_ref()
                    .ok_or_else(|| anyhow!("no GraphQL endpoint configured"))?;
                info!(http = %endpoints.http, ws = %endpoints.ws, "connecting to backend");
                (ChannelRouter::connect(endpoints, provider), None)
            }
        };
        Ok(Self {
            credentials,
            directory: ChatDirectory::new(router.clone()),
            session: ChatSession::new(router),
            settings,
            mock,
        })
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn directory(&self) -> &ChatDirectory {
        &self.directory
    }

    /// The in-process backend when running with `backend.kind: mock`.
    pub fn mock_backend(&self) -> Option<&MockBackend> {
        self.mock.as_ref()
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        Ok(self.directory.refresh().await?)
    }

    pub async fn new_chat(&self, title: &str) -> Result<Uuid> {
        let user_id = self
            .settings
            .user_id
            .context("session.user_id is required to create chats")?;
        Ok(self.directory.create(title, user_id).await?.id)
    }

    pub async fn delete_chat(&mut self, chat_id: Uuid) -> Result<bool> {
        let deleted = self.directory.delete(chat_id).await?;
        self.session.chat_deleted(chat_id).await;
        Ok(deleted)
    }

    /// Print the chat list every poll interval, `limit` times or forever.
    pub async fn watch_chats<W: Write>(&self, out: &mut W, limit: Option<usize>) -> Result<()> {
        let updates = self.directory.poll(self.settings.poll_interval);
        let mut updates = match limit {
            Some(limit) => updates.take(limit).boxed(),
            None => updates,
        };
        while let Some(result) = updates.next().await {
            match result {
                Ok(chats) => {
                    for line in render::chat_list(&chats) {
                        writeln!(out, "{line}")?;
                    }
                    writeln!(out)?;
                }
                Err(err) => {
                    writeln!(out, "{}", render::error_banner(&err))?;
                    if !self.credentials.is_signed_in() {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Open `chat_id` and run the message view until the user quits, input
    /// ends, the chat goes away or the session is signed out.
    pub async fn run_conversation<R, W>(&mut self, chat_id: Uuid, input: R, out: &mut W) -> Result<Exit>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        let mut signed_in = self.credentials.watch_signed_in();
        if !*signed_in.borrow_and_update() {
            writeln!(out, "Not signed in. Set session.access_token in parley.yaml.")?;
            return Ok(Exit::SignedOut);
        }

        self.session.open_chat(chat_id).await;
        if let Some(line) = render::phase_line(self.session.phase()) {
            writeln!(out, "{line}")?;
        }

        let exit = loop {
            tokio::select! {
                update = self.session.next_update() => {
                    for line in render::update_lines(&self.session, &update) {
                        writeln!(out, "{line}")?;
                    }
                    if update == SessionUpdate::Ended {
                        break Exit::ServerEnded;
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break Exit::InputClosed;
                    };
                    match ChatCommand::parse(&line) {
                        ChatCommand::Empty => {}
                        ChatCommand::Quit => break Exit::Quit,
                        ChatCommand::Send(content) => self.send(&content, out).await?,
                        ChatCommand::Retry => {
                            let draft = self.session.input().to_string();
                            if draft.is_empty() {
                                writeln!(out, "Nothing to retry.")?;
                            } else {
                                self.send(&draft, out).await?;
                            }
                        }
                        ChatCommand::Delete => match self.delete_chat(chat_id).await {
                            Ok(_) => {
                                writeln!(out, "Chat deleted.")?;
                                break Exit::ChatDeleted;
                            }
                            Err(err) => writeln!(out, "! {err}")?,
                        },
                    }
                }
                changed = signed_in.changed() => {
                    if changed.is_err() || !*signed_in.borrow_and_update() {
                        writeln!(out, "Signed out. Please sign in again.")?;
                        break Exit::SignedOut;
                    }
                }
            }
        };

        if exit != Exit::ChatDeleted {
            self.session.close_chat().await;
        }
        info!(?exit, %chat_id, "conversation closed");
        Ok(exit)
    }

    async fn send<W: Write>(&mut self, content: &str, out: &mut W) -> Result<()> {
        if let Err(err) = self.session.send_local(content).await {
            warn!(error = %err, "message not sent");
            writeln!(out, "{}", render::error_banner(&err))?;
            if !self.session.input().is_empty() {
                writeln!(out, "Draft kept. Type /retry to send it again.")?;
            }
        }
        Ok(())
    }
}
