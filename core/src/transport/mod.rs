//! Unary and streaming channels the router dispatches over.

pub mod http;
pub mod mock;
pub mod retry;
pub mod ws;

use crate::auth::AuthHeaders;
use crate::error::{ClientError, GraphQlError};
use crate::operation::Operation;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::HttpChannel;
pub use mock::MockBackend;
pub use retry::RetryPolicy;
pub use ws::WsChannel;

/// Body of a GraphQL result, from HTTP or a `next` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Turn a non-empty `errors` array into a typed error.
    pub fn into_result(self) -> Result<Self, ClientError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(ClientError::from_graphql(self.errors))
        }
    }

    pub fn into_data(self) -> Result<Value, ClientError> {
        let response = self.into_result()?;
        response
            .data
            .ok_or_else(|| ClientError::Decode("response carried no data".to_string()))
    }
}

/// Server pushes for one subscription, until cancelled or the connection drops.
pub type ResponseStream = BoxStream<'static, Result<GraphQlResponse, ClientError>>;

/// Request/response transport. Stateless between calls.
#[async_trait]
pub trait UnaryChannel: Send + Sync {
    async fn execute(
        &self,
        operation: &Operation,
        headers: &AuthHeaders,
    ) -> Result<GraphQlResponse, ClientError>;
}

/// Connection-scoped transport for subscriptions.
///
/// Credentials are supplied when the connection is established, not per
/// message, so implementations hold their own injector.
#[async_trait]
pub trait StreamingChannel: Send + Sync {
    async fn subscribe(&self, operation: &Operation) -> Result<ResponseStream, ClientError>;
}
