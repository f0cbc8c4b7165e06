use parley_core::auth::SessionCredentials;
use parley_core::conversation::{Message, MessageRole, Phase};
use parley_core::{ChannelRouter, ChatSession, ClientError, MockBackend, SessionUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

fn session(backend: &MockBackend, credentials: &SessionCredentials) -> ChatSession {
    ChatSession::new(ChannelRouter::mock(
        backend.clone(),
        Arc::new(credentials.clone()),
    ))
}

async fn next(session: &mut ChatSession) -> SessionUpdate {
    timeout(Duration::from_secs(5), session.next_update())
        .await
        .expect("session update")
}

async fn wait_for_messages(session: &mut ChatSession, count: usize) {
    while session.messages().len() < count {
        next(session).await;
    }
}

async fn wait_for_subscriptions(backend: &MockBackend, count: usize) {
    timeout(Duration::from_secs(5), async {
        while backend.active_subscriptions() != count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscription count");
}

#[tokio::test]
async fn messages_arrive_in_order_and_switching_cancels_previous_chat() {
    let backend = MockBackend::new();
    let credentials = SessionCredentials::with_token("token");
    let a = backend.seed_chat("A", Uuid::new_v4());
    let b = backend.seed_chat("B", Uuid::new_v4());
    let mut session = session(&backend, &credentials);

    session.open_chat(a).await;
    assert_eq!(session.phase(), Phase::Loading);
    assert_eq!(next(&mut session).await, SessionUpdate::Live);
    assert_eq!(session.phase(), Phase::Live);

    let sent: Vec<Message> = ["t1", "t2", "t3"]
        .into_iter()
        .map(|text| Message::new(MessageRole::User, text))
        .collect();
    for message in &sent {
        backend.push_message(a, message.clone());
    }
    wait_for_messages(&mut session, 3).await;
    let ids: Vec<Uuid> = session.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids, sent.iter().map(|m| m.id).collect::<Vec<_>>());

    session.open_chat(b).await;
    assert_eq!(session.phase(), Phase::Loading);
    assert!(session.messages().is_empty());
    assert_eq!(next(&mut session).await, SessionUpdate::Live);
    wait_for_subscriptions(&backend, 1).await;

    backend.push_message(a, Message::new(MessageRole::User, "late for a"));
    assert!(session.drain().is_empty());
    assert!(session.messages().is_empty());
}

#[tokio::test]
async fn offline_send_restores_draft_until_server_confirms() {
    let backend = MockBackend::new();
    let credentials = SessionCredentials::with_token("token");
    let chat = backend.seed_chat("A", Uuid::new_v4());
    let mut session = session(&backend, &credentials);
    session.open_chat(chat).await;
    next(&mut session).await;

    backend.fail_next_unary(ClientError::Network("offline".into()));
    session.set_input("hello while offline");
    let err = session.submit().await.unwrap_err();
    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(session.input(), "hello while offline");
    assert!(matches!(session.error(), Some(ClientError::Network(_))));
    assert!(!session.is_typing());
    assert!(session.messages().is_empty());
    assert_eq!(credentials.sign_out_count(), 0);

    session.submit().await.expect("retry");
    assert_eq!(session.input(), "");
    assert!(session.error().is_none());
    wait_for_messages(&mut session, 2).await;
    let roles: Vec<MessageRole> = session.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(
        session.messages()[1].content,
        "[Mock] received 'hello while offline'."
    );
    assert!(!session.is_typing());
}

#[tokio::test]
async fn auth_error_on_unary_channel_signs_out_once() {
    let backend = MockBackend::new();
    backend.require_token("fresh");
    let credentials = SessionCredentials::with_token("stale");
    let chat = backend.seed_chat("A", Uuid::new_v4());
    let mut session = session(&backend, &credentials);
    session.open_chat(chat).await;
    next(&mut session).await;

    let err = session.send_local("hi").await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(credentials.sign_out_count(), 1);
    assert!(!credentials.is_signed_in());
    assert_eq!(session.input(), "hi");
}

#[tokio::test]
async fn auth_error_on_streaming_channel_signs_out_once() {
    let backend = MockBackend::new();
    let credentials = SessionCredentials::with_token("token");
    let mut signed_in = credentials.watch_signed_in();
    let chat = backend.seed_chat("A", Uuid::new_v4());
    backend.fail_next_subscribe(ClientError::Auth {
        code: "unauthorized".into(),
        message: "4401".into(),
    });
    let mut session = session(&backend, &credentials);
    session.open_chat(chat).await;

    match next(&mut session).await {
        SessionUpdate::Error(err) => assert!(err.is_auth()),
        other => panic!("expected auth error, got {other:?}"),
    }
    assert_eq!(credentials.sign_out_count(), 1);
    signed_in.changed().await.expect("watch");
    assert!(!*signed_in.borrow());
}

#[tokio::test]
async fn duplicate_snapshots_do_not_repeat_messages() {
    let backend = MockBackend::new();
    let credentials = SessionCredentials::with_token("token");
    let chat = backend.seed_chat("A", Uuid::new_v4());
    let first = Message::new(MessageRole::User, "one");
    backend.push_message(chat, first.clone());
    let mut session = session(&backend, &credentials);
    session.open_chat(chat).await;
    wait_for_messages(&mut session, 1).await;

    backend.drop_connections();
    assert_eq!(next(&mut session).await, SessionUpdate::Resubscribing);
    // The fresh subscription replays the full list; nothing new is appended.
    assert_eq!(next(&mut session).await, SessionUpdate::Live);
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].id, first.id);
}

#[tokio::test]
async fn deleting_the_open_chat_closes_it() {
    let backend = MockBackend::new();
    let credentials = SessionCredentials::with_token("token");
    let chat = backend.seed_chat("A", Uuid::new_v4());
    let mut session = session(&backend, &credentials);
    session.open_chat(chat).await;
    next(&mut session).await;

    session.chat_deleted(Uuid::new_v4()).await;
    assert_eq!(session.phase(), Phase::Live);
    session.chat_deleted(chat).await;
    assert_eq!(session.phase(), Phase::Closed);
    assert!(!session.has_subscription());
    wait_for_subscriptions(&backend, 0).await;
}
