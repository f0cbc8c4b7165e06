use parley::{Exit, ParleyApp};
use parley_core::config::ClientSettings;
use parley_core::ClientError;
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::sleep;

/// Feed `lines` to the conversation one at a time, pausing between them so
/// the backend can answer.
fn typed(lines: &'static [&'static str]) -> BufReader<DuplexStream> {
    let (mut writer, reader) = duplex(1024);
    tokio::spawn(async move {
        for line in lines {
            sleep(Duration::from_millis(500)).await;
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    });
    BufReader::new(reader)
}

fn output(buffer: Vec<u8>) -> String {
    String::from_utf8(buffer).expect("utf8 output")
}

#[tokio::test(start_paused = true)]
async fn conversation_prints_reply_and_quits() {
    let mut app = ParleyApp::from_settings(ClientSettings::mock()).expect("app");
    let chat_id = app.new_chat("Smoke").await.expect("chat");

    let mut out = Vec::new();
    let exit = app
        .run_conversation(chat_id, typed(&["hello", "/quit"]), &mut out)
        .await
        .expect("conversation");

    assert_eq!(exit, Exit::Quit);
    let printed = output(out);
    assert!(printed.contains("Loading messages..."));
    assert!(printed.contains("You: hello"));
    assert!(printed.contains("Assistant: [Mock] received 'hello'."));
    assert_eq!(app.session().chat_id(), None);
}

#[tokio::test(start_paused = true)]
async fn failed_send_keeps_draft_for_retry() {
    let mut app = ParleyApp::from_settings(ClientSettings::mock()).expect("app");
    let chat_id = app.new_chat("Retry").await.expect("chat");
    let backend = app.mock_backend().expect("mock").clone();
    backend.fail_next_unary(ClientError::Network("offline".into()));

    let mut out = Vec::new();
    let exit = app
        .run_conversation(chat_id, typed(&["first try", "/retry", "/quit"]), &mut out)
        .await
        .expect("conversation");

    assert_eq!(exit, Exit::Quit);
    let printed = output(out);
    assert!(printed.contains("Network unavailable"));
    assert!(printed.contains("Draft kept"));
    assert!(printed.contains("You: first try"));
    assert_eq!(backend.messages(chat_id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn delete_command_leaves_the_chat() {
    let mut app = ParleyApp::from_settings(ClientSettings::mock()).expect("app");
    let chat_id = app.new_chat("Doomed").await.expect("chat");

    let mut out = Vec::new();
    let exit = app
        .run_conversation(chat_id, typed(&["/delete"]), &mut out)
        .await
        .expect("conversation");

    assert_eq!(exit, Exit::ChatDeleted);
    assert!(app.list_chats().await.expect("list").is_empty());
    assert!(output(out).contains("Chat deleted."));
}

#[tokio::test(start_paused = true)]
async fn sign_out_ends_the_conversation() {
    let mut app = ParleyApp::from_settings(ClientSettings::mock()).expect("app");
    let chat_id = app.new_chat("Auth").await.expect("chat");
    app.mock_backend().expect("mock").require_token("rotated");

    let mut out = Vec::new();
    let exit = app
        .run_conversation(chat_id, typed(&["are you there?", "/quit"]), &mut out)
        .await
        .expect("conversation");

    assert_eq!(exit, Exit::SignedOut);
    assert_eq!(app.credentials().sign_out_count(), 1);
    assert!(output(out).contains("sign in again"));
}

#[tokio::test(start_paused = true)]
async fn watch_prints_each_refresh() {
    let app = ParleyApp::from_settings(ClientSettings::mock()).expect("app");
    app.new_chat("Listed").await.expect("chat");

    let mut out = Vec::new();
    app.watch_chats(&mut out, Some(2)).await.expect("watch");
    assert_eq!(output(out).matches("Listed").count(), 2);
}
