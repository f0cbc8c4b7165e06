//! Plain-text rendering for the terminal front-end.

use parley_core::conversation::{Message, MessageRole, Phase};
use parley_core::documents::ChatSummary;
use parley_core::{ChatSession, ClientError, SessionUpdate};

const PREVIEW_CHARS: usize = 48;

pub fn role_badge(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "You",
        MessageRole::Assistant => "Assistant",
    }
}

pub fn message_line(message: &Message) -> String {
    format!("{}: {}", role_badge(message.role), message.content)
}

/// One row of the chat list: id, title, last update and a preview.
pub fn chat_line(chat: &ChatSummary) -> String {
    let preview = chat
        .last_message()
        .map(|last| truncate(&last.content, PREVIEW_CHARS))
        .unwrap_or_else(|| "(no messages)".to_string());
    format!(
        "{}  {}  {}  {}",
        chat.id,
        chat.title,
        chat.updated_at.format("%Y-%m-%d %H:%M"),
        preview
    )
}

pub fn chat_list(chats: &[ChatSummary]) -> Vec<String> {
    if chats.is_empty() {
        return vec!["No chats yet. Create one with `parley new`.".to_string()];
    }
    chats.iter().map(chat_line).collect()
}

pub fn error_banner(err: &ClientError) -> String {
    format!("! {}", err.user_message())
}

pub fn phase_line(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Loading => Some("Loading messages..."),
        Phase::Closed => Some("Chat closed."),
        Phase::Idle | Phase::Live => None,
    }
}

/// Lines to print for a session update. `Messages(n)` prints the last `n`
/// messages of the conversation.
pub fn update_lines(session: &ChatSession, update: &SessionUpdate) -> Vec<String> {
    match update {
        SessionUpdate::Live => {
            let messages = session.messages();
            if messages.is_empty() {
                vec!["(no messages yet)".to_string()]
            } else {
                messages.iter().map(message_line).collect()
            }
        }
        SessionUpdate::Messages(count) => {
            let messages = session.messages();
            let start = messages.len().saturating_sub(*count);
            let mut lines: Vec<String> = messages[start..].iter().map(message_line).collect();
            if session.is_typing() {
                lines.push("Assistant is typing...".to_string());
            }
            lines
        }
        SessionUpdate::Resubscribing => vec!["Connection lost, reconnecting...".to_string()],
        SessionUpdate::TypingExpired => vec!["(no reply yet)".to_string()],
        SessionUpdate::Ended => vec!["The server ended this conversation.".to_string()],
        SessionUpdate::Error(err) => vec![error_banner(err)],
    }
}

fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let mut cut: String = single_line.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
