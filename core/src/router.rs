use crate::auth::{CredentialInjector, CredentialProvider};
use crate::config::Endpoints;
use crate::error::ClientError;
use crate::fault::FaultInterceptor;
use crate::operation::{ChannelKind, Operation};
use crate::transport::{
    GraphQlResponse, HttpChannel, MockBackend, ResponseStream, RetryPolicy, StreamingChannel,
    UnaryChannel, WsChannel,
};
use futures::StreamExt;
use std::sync::Arc;

/// What `send` produced, depending on the channel the operation went over.
pub enum Routed {
    Response(GraphQlResponse),
    Stream(ResponseStream),
}

/// Owns one unary and one streaming channel and picks between them per
/// operation. Every error on the way back passes the fault interceptor.
#[derive(Clone)]
pub struct ChannelRouter {
    unary: Arc<dyn UnaryChannel>,
    streaming: Arc<dyn StreamingChannel>,
    injector: CredentialInjector,
    faults: FaultInterceptor,
}

impl ChannelRouter {
    pub fn new(
        unary: Arc<dyn UnaryChannel>,
        streaming: Arc<dyn StreamingChannel>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            unary,
            streaming,
            injector: CredentialInjector::new(provider.clone()),
            faults: FaultInterceptor::new(provider),
        }
    }

    /// HTTP for queries and mutations, WebSocket for subscriptions.
    pub fn connect(endpoints: &Endpoints, provider: Arc<dyn CredentialProvider>) -> Self {
        let injector = CredentialInjector::new(provider.clone());
        let unary = Arc::new(HttpChannel::new(endpoints.http.clone()));
        let streaming = Arc::new(WsChannel::with_policy(
            endpoints.ws.clone(),
            injector,
            RetryPolicy::default(),
        ));
        Self::new(unary, streaming, provider)
    }

    pub fn mock(backend: MockBackend, provider: Arc<dyn CredentialProvider>) -> Self {
        Self::new(Arc::new(backend.clone()), Arc::new(backend), provider)
    }

    pub async fn send(&self, operation: &Operation) -> Result<Routed, ClientError> {
        match operation.channel() {
            ChannelKind::Unary => self.execute(operation).await.map(Routed::Response),
            ChannelKind::Streaming => self.subscribe(operation).await.map(Routed::Stream),
        }
    }

    /// One request/response exchange with freshly pulled auth headers.
    pub async fn execute(&self, operation: &Operation) -> Result<GraphQlResponse, ClientError> {
        if operation.channel() != ChannelKind::Unary {
            return self.faults.inspect(Err(ClientError::Validation(
                "subscriptions must be opened with subscribe".to_string(),
            )));
        }
        let headers = self.injector.current_headers();
        self.faults
            .inspect(self.unary.execute(operation, &headers).await)
    }

    /// Open a subscription. The stream runs until dropped or the connection
    /// goes away; errors inside it are observed as they pass.
    pub async fn subscribe(&self, operation: &Operation) -> Result<ResponseStream, ClientError> {
        if operation.channel() != ChannelKind::Streaming {
            return self.faults.inspect(Err(ClientError::Validation(
                "queries and mutations must be sent with execute".to_string(),
            )));
        }
        let stream = self
            .faults
            .inspect(self.streaming.subscribe(operation).await)?;
        let faults = self.faults.clone();
        Ok(stream
            .inspect(move |item| {
                if let Err(err) = item {
                    faults.observe(err);
                }
            })
            .boxed())
    }
}
