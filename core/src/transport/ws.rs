use super::retry::RetryPolicy;
use super::{GraphQlResponse, ResponseStream, StreamingChannel};
use crate::auth::CredentialInjector;
use crate::error::{ClientError, GraphQlError};
use crate::operation::Operation;
use async_trait::async_trait;
use futures::stream::{SplitSink, Stream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// How long an idle connection stays open after its last subscription
/// completes, so that switching chats reuses the socket.
pub const LAZY_CLOSE_DELAY: Duration = Duration::from_millis(1_000);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Event = Result<GraphQlResponse, ClientError>;

/// Frames of the `graphql-transport-ws` protocol, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: Value,
    },
    Next {
        id: String,
        payload: GraphQlResponse,
    },
    Error {
        id: String,
        payload: Vec<GraphQlError>,
    },
    Complete {
        id: String,
    },
}

impl ProtocolMessage {
    fn to_text(&self) -> Result<Message, ClientError> {
        serde_json::to_string(self)
            .map(Message::Text)
            .map_err(|err| ClientError::Protocol(err.to_string()))
    }

    fn parse(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|err| ClientError::Protocol(err.to_string()))
    }
}

enum Command {
    Subscribe {
        id: String,
        payload: Value,
        events: UnboundedSender<Event>,
    },
    Complete {
        id: String,
    },
    Shutdown,
}

struct ConnectionHandle {
    commands: UnboundedSender<Command>,
}

/// Streaming channel over a single shared WebSocket.
///
/// The socket is opened on the first subscribe, shared by every active
/// subscription, and closed `lazy_close` after the last one completes. A
/// dropped socket ends every open stream with `ConnectionLost`; the next
/// subscribe dials again under the retry policy. Missed events are not
/// replayed.
///
/// Dials are serialized: concurrent subscribers wait for one dial instead of
/// opening sockets of their own. Status checks and `disconnect` never wait
/// for a dial.
pub struct WsChannel {
    endpoint: Url,
    injector: CredentialInjector,
    policy: RetryPolicy,
    lazy_close: Duration,
    connection: parking_lot::Mutex<Option<ConnectionHandle>>,
    dialing: tokio::sync::Mutex<()>,
}

impl WsChannel {
    pub fn new(endpoint: Url, injector: CredentialInjector) -> Self {
        Self::with_policy(endpoint, injector, RetryPolicy::default())
    }

    pub fn with_policy(endpoint: Url, injector: CredentialInjector, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            injector,
            policy,
            lazy_close: LAZY_CLOSE_DELAY,
            connection: parking_lot::Mutex::new(None),
            dialing: tokio::sync::Mutex::new(()),
        }
    }

    /// Override how long an idle connection lingers before closing.
    pub fn with_lazy_close(mut self, delay: Duration) -> Self {
        self.lazy_close = delay;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.live_commands().is_some()
    }

    /// Drop the current connection. Open streams end with `Cancelled`. A dial
    /// already in progress is not interrupted.
    pub fn disconnect(&self) {
        if let Some(handle) = self.connection.lock().take() {
            let _ = handle.commands.send(Command::Shutdown);
        }
    }

    fn live_commands(&self) -> Option<UnboundedSender<Command>> {
        self.connection
            .lock()
            .as_ref()
            .filter(|handle| !handle.commands.is_closed())
            .map(|handle| handle.commands.clone())
    }

    async fn commands(&self) -> Result<UnboundedSender<Command>, ClientError> {
        if let Some(commands) = self.live_commands() {
            return Ok(commands);
        }
        let _dial = self.dialing.lock().await;
        // Another subscriber may have finished dialing while we waited.
        if let Some(commands) = self.live_commands() {
            return Ok(commands);
        }
        let socket = self.policy.run(|attempt| self.connect_once(attempt)).await?;
        let (commands, rx) = unbounded_channel();
        tokio::spawn(drive_connection(socket, rx, self.lazy_close));
        *self.connection.lock() = Some(ConnectionHandle {
            commands: commands.clone(),
        });
        Ok(commands)
    }

    async fn connect_once(&self, attempt: u32) -> Result<Socket, ClientError> {
        // Pulled per attempt so a refreshed token is used on reconnect.
        let headers = self.injector.current_headers();
        let mut request = self.endpoint.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        debug!(attempt, endpoint = %self.endpoint, "opening streaming connection");
        let (mut socket, _) = connect_async(request).await?;

        let init = ProtocolMessage::ConnectionInit {
            payload: Some(json!({ "headers": headers })),
        };
        socket.send(init.to_text()?).await?;

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match ProtocolMessage::parse(&text)? {
                    ProtocolMessage::ConnectionAck { .. } => {
                        info!(endpoint = %self.endpoint, "streaming connection acknowledged");
                        return Ok(socket);
                    }
                    ProtocolMessage::Ping { payload } => {
                        socket.send(ProtocolMessage::Pong { payload }.to_text()?).await?;
                    }
                    other => {
                        return Err(ClientError::Protocol(format!(
                            "expected connection_ack, got {other:?}"
                        )))
                    }
                },
                Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(ClientError::ConnectionLost(
                        "closed before connection_ack".to_string(),
                    ))
                }
            }
        }
    }

    fn register(
        commands: &UnboundedSender<Command>,
        operation: &Operation,
    ) -> Option<SubscriptionStream> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(operation.payload()).ok()?;
        let (events, rx) = unbounded_channel();
        commands
            .send(Command::Subscribe {
                id: id.clone(),
                payload,
                events,
            })
            .ok()?;
        Some(SubscriptionStream {
            id,
            events: rx,
            commands: commands.clone(),
        })
    }
}

#[async_trait]
impl StreamingChannel for WsChannel {
    async fn subscribe(&self, operation: &Operation) -> Result<ResponseStream, ClientError> {
        // The connection may close lazily between lookup and registration;
        // one redial covers that window.
        for _ in 0..2 {
            let commands = self.commands().await?;
            if let Some(stream) = Self::register(&commands, operation) {
                debug!(
                    operation = operation.name().unwrap_or("anonymous"),
                    id = %stream.id,
                    "subscription started"
                );
                return Ok(stream.boxed());
            }
        }
        Err(ClientError::ConnectionLost(
            "connection closed while subscribing".to_string(),
        ))
    }
}

/// One subscription's events. Dropping it sends `complete` for its id.
struct SubscriptionStream {
    id: String,
    events: UnboundedReceiver<Event>,
    commands: UnboundedSender<Command>,
}

impl Stream for SubscriptionStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Complete {
            id: self.id.clone(),
        });
    }
}

async fn drive_connection(
    socket: Socket,
    mut commands: UnboundedReceiver<Command>,
    lazy_close: Duration,
) {
    let (mut sink, mut frames) = socket.split();
    let mut subscribers: HashMap<String, UnboundedSender<Event>> = HashMap::new();
    // Set while no subscription is active.
    let mut idle_until: Option<Instant> = None;

    let reason = loop {
        let linger = idle_until;
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Subscribe { id, payload, events }) => {
                    let frame = ProtocolMessage::Subscribe { id: id.clone(), payload };
                    if let Err(err) = send_frame(&mut sink, &frame).await {
                        let _ = events.send(Err(err.clone()));
                        break err;
                    }
                    subscribers.insert(id, events);
                    idle_until = None;
                }
                Some(Command::Complete { id }) => {
                    if subscribers.remove(&id).is_some() {
                        debug!(%id, "subscription cancelled");
                        let _ = send_frame(&mut sink, &ProtocolMessage::Complete { id }).await;
                    }
                    if subscribers.is_empty() && idle_until.is_none() {
                        idle_until = Some(Instant::now() + lazy_close);
                    }
                }
                Some(Command::Shutdown) => {
                    let _ = sink.close().await;
                    break ClientError::Cancelled;
                }
                None => {
                    let _ = sink.close().await;
                    break ClientError::ConnectionLost("channel dropped".to_string());
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = dispatch(&text, &mut subscribers, &mut sink).await {
                        break err;
                    }
                }
                Some(Ok(Message::Close(frame))) => break close_error(frame),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    break match ClientError::from(err) {
                        auth @ ClientError::Auth { .. } => auth,
                        other => ClientError::ConnectionLost(other.to_string()),
                    };
                }
                None => break ClientError::ConnectionLost("socket closed".to_string()),
            },
            _ = sleep_until(linger.unwrap_or_else(Instant::now)), if linger.is_some() => {
                debug!("no subscriptions left, closing streaming connection");
                commands.close();
                while let Ok(command) = commands.try_recv() {
                    if let Command::Subscribe { events, .. } = command {
                        let _ = events.send(Err(ClientError::ConnectionLost(
                            "connection closed while subscribing".to_string(),
                        )));
                    }
                }
                let _ = sink.close().await;
                return;
            }
        }
    };

    if !subscribers.is_empty() {
        warn!(error = %reason, active = subscribers.len(), "streaming connection dropped");
    }
    for (_, events) in subscribers.drain() {
        let _ = events.send(Err(reason.clone()));
    }
}

async fn dispatch(
    text: &str,
    subscribers: &mut HashMap<String, UnboundedSender<Event>>,
    sink: &mut SplitSink<Socket, Message>,
) -> Result<(), ClientError> {
    match ProtocolMessage::parse(text)? {
        ProtocolMessage::Next { id, payload } => {
            if let Some(events) = subscribers.get(&id) {
                let _ = events.send(payload.into_result());
            }
        }
        ProtocolMessage::Error { id, payload } => {
            if let Some(events) = subscribers.remove(&id) {
                let _ = events.send(Err(ClientError::from_graphql(payload)));
            }
        }
        ProtocolMessage::Complete { id } => {
            // Dropping the sender ends the caller's stream.
            subscribers.remove(&id);
        }
        ProtocolMessage::Ping { payload } => {
            send_frame(sink, &ProtocolMessage::Pong { payload }).await?;
        }
        ProtocolMessage::Pong { .. } | ProtocolMessage::ConnectionAck { .. } => {}
        other => debug!(?other, "ignoring unexpected frame"),
    }
    Ok(())
}

async fn send_frame(
    sink: &mut SplitSink<Socket, Message>,
    frame: &ProtocolMessage,
) -> Result<(), ClientError> {
    sink.send(frame.to_text()?)
        .await
        .map_err(|err| ClientError::ConnectionLost(err.to_string()))
}

fn close_error(frame: Option<CloseFrame<'_>>) -> ClientError {
    match frame {
        Some(frame) => ClientError::from_close(u16::from(frame.code), &frame.reason),
        None => ClientError::ConnectionLost("closed without a frame".to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{with_subprotocol, ScriptedServer};
    use super::*;
    use crate::auth::SessionCredentials;
    use crate::documents;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;

    #[test]
    fn frames_use_protocol_field_names() {
        let frame = ProtocolMessage::Subscribe {
            id: "1".into(),
            payload: json!({ "query": "subscription { x }" }),
        };
        let value = serde_json::to_value(&frame).expect("json");
        assert_eq!(value["type"], "subscribe");
        let init = serde_json::to_value(ProtocolMessage::ConnectionInit { payload: None })
            .expect("json");
        assert_eq!(init, json!({ "type": "connection_init" }));
        let error = ProtocolMessage::parse(
            r#"{"type":"error","id":"9","payload":[{"message":"x","extensions":{"code":"invalid-jwt"}}]}"#,
        )
        .expect("parse");
        assert!(matches!(error, ProtocolMessage::Error { ref payload, .. } if payload[0].is_auth()));
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.expect("accept");
        accept_hdr_async(stream, with_subprotocol)
            .await
            .expect("handshake")
    }

    async fn recv(server: &mut WebSocketStream<TcpStream>) -> ProtocolMessage {
        loop {
            match server.next().await.expect("frame").expect("frame ok") {
                Message::Text(text) => return ProtocolMessage::parse(&text).expect("protocol"),
                _ => continue,
            }
        }
    }

    async fn send(server: &mut WebSocketStream<TcpStream>, frame: ProtocolMessage) {
        server.send(frame.to_text().expect("text")).await.expect("send");
    }

    #[tokio::test]
    async fn subscribes_with_connection_scoped_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let init = recv(&mut socket).await;
            send(&mut socket, ProtocolMessage::ConnectionAck { payload: None }).await;
            let ProtocolMessage::Subscribe { id, payload } = recv(&mut socket).await else {
                panic!("expected subscribe");
            };
            send(
                &mut socket,
                ProtocolMessage::Next {
                    id: id.clone(),
                    payload: GraphQlResponse::from_data(json!({ "messages": [] })),
                },
            )
            .await;
            send(&mut socket, ProtocolMessage::Complete { id }).await;
            (init, payload)
        });

        let session = SessionCredentials::with_token("ws-token");
        let channel = WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/v1/graphql")).expect("url"),
            CredentialInjector::new(Arc::new(session)),
            RetryPolicy::immediate(),
        );
        let mut stream = channel
            .subscribe(&documents::subscribe_messages(Uuid::new_v4()))
            .await
            .expect("subscribe");
        let first = stream.next().await.expect("event").expect("data");
        assert_eq!(first.data, Some(json!({ "messages": [] })));
        assert!(stream.next().await.is_none());

        let (init, payload) = server.await.expect("server");
        let ProtocolMessage::ConnectionInit { payload: Some(init) } = init else {
            panic!("expected connection_init with payload");
        };
        assert_eq!(init["headers"]["Authorization"], "Bearer ws-token");
        assert_eq!(payload["operationName"], "MessagesSubscription");
    }

    #[tokio::test]
    async fn auth_close_during_handshake_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let _ = recv(&mut socket).await;
            socket
                .close(Some(CloseFrame {
                    code: 4403u16.into(),
                    reason: "Forbidden".into(),
                }))
                .await
                .ok();
            // A retry would block here and fail the join below.
            tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        });

        let channel = WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/")).expect("url"),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("bad"))),
            RetryPolicy::immediate(),
        );
        let err = match channel.subscribe(&documents::list_chats()).await {
            Ok(_) => panic!("expected the handshake to be rejected"),
            Err(err) => err,
        };
        assert!(err.is_auth());
        assert!(server.await.expect("server"), "client retried after auth rejection");
    }

    #[tokio::test]
    async fn disconnect_cancels_open_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let _ = recv(&mut socket).await;
            send(&mut socket, ProtocolMessage::ConnectionAck { payload: None }).await;
            let _ = recv(&mut socket).await;
            while let Some(Ok(frame)) = socket.next().await {
                if frame.is_close() {
                    return true;
                }
            }
            false
        });

        let channel = WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/")).expect("url"),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("t"))),
            RetryPolicy::immediate(),
        );
        let mut stream = channel
            .subscribe(&documents::subscribe_messages(Uuid::new_v4()))
            .await
            .expect("subscribe");
        assert!(channel.is_connected());

        channel.disconnect();
        let ended = stream.next().await.expect("event");
        assert!(matches!(ended, Err(ClientError::Cancelled)));
        assert!(stream.next().await.is_none());
        assert!(!channel.is_connected());
        assert!(server.await.expect("server"), "server never saw the close");
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let channel = WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/")).expect("url"),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("t"))),
            RetryPolicy::immediate(),
        );
        match channel.subscribe(&documents::list_chats()).await {
            Err(ClientError::Connection { attempts, .. }) => assert_eq!(attempts, 6),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn dropped_socket_ends_every_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            let _ = recv(&mut socket).await;
            send(&mut socket, ProtocolMessage::ConnectionAck { payload: None }).await;
            let ProtocolMessage::Subscribe { id, .. } = recv(&mut socket).await else {
                panic!("expected subscribe");
            };
            let _ = recv(&mut socket).await;
            send(
                &mut socket,
                ProtocolMessage::Next {
                    id,
                    payload: GraphQlResponse::from_data(json!({ "messages": [] })),
                },
            )
            .await;
            // No close frame: the TCP connection just goes away.
            drop(socket);
        });

        let channel = WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/")).expect("url"),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("t"))),
            RetryPolicy::immediate(),
        );
        let mut first = channel
            .subscribe(&documents::subscribe_messages(Uuid::new_v4()))
            .await
            .expect("first subscribe");
        let mut second = channel
            .subscribe(&documents::subscribe_messages(Uuid::new_v4()))
            .await
            .expect("second subscribe");

        assert!(first.next().await.expect("event").is_ok());
        assert!(matches!(
            first.next().await.expect("event"),
            Err(ClientError::ConnectionLost(_))
        ));
        assert!(first.next().await.is_none());
        assert!(matches!(
            second.next().await.expect("event"),
            Err(ClientError::ConnectionLost(_))
        ));
        assert!(second.next().await.is_none());
        assert!(!channel.is_connected());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn idle_connection_closes_after_the_last_stream() {
        let mut server = ScriptedServer::start().await;
        let chat_id = Uuid::new_v4();
        let channel = WsChannel::with_policy(
            server.url(),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("t"))),
            RetryPolicy::immediate(),
        )
        .with_lazy_close(Duration::from_millis(50));

        let mut stream = channel
            .subscribe(&documents::subscribe_messages(chat_id))
            .await
            .expect("subscribe");
        assert!(stream.next().await.expect("event").is_ok());
        drop(stream);
        assert!(channel.is_connected(), "closed before the grace period");

        assert_eq!(server.next_frame().await, "init");
        assert_eq!(server.next_frame().await, format!("subscribe {chat_id}"));
        assert_eq!(server.next_frame().await, format!("complete {chat_id}"));
        assert_eq!(server.next_frame().await, "closed");
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection released");
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn status_and_disconnect_do_not_wait_for_a_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accepts TCP but never completes the WebSocket handshake.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let channel = Arc::new(WsChannel::with_policy(
            Url::parse(&format!("ws://{addr}/")).expect("url"),
            CredentialInjector::new(Arc::new(SessionCredentials::with_token("t"))),
            RetryPolicy::immediate(),
        ));
        let dialing = tokio::spawn({
            let channel = channel.clone();
            async move {
                let _ = channel.subscribe(&documents::list_chats()).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!channel.is_connected());
        channel.disconnect();
        assert!(!dialing.is_finished());
        dialing.abort();
        server.abort();
    }
}
