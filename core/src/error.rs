use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// GraphQL error codes that mean the session credential is invalid or expired.
const AUTH_CODES: &[&str] = &["invalid-jwt", "unauthenticated"];

/// GraphQL error codes raised for malformed operations or input.
const VALIDATION_CODES: &[&str] = &["validation-failed", "bad-request", "parse-failed"];

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: Some(serde_json::json!({ "code": code })),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }

    pub fn is_auth(&self) -> bool {
        self.code().is_some_and(|code| AUTH_CODES.contains(&code))
    }

    pub fn is_validation(&self) -> bool {
        self.code()
            .is_some_and(|code| VALIDATION_CODES.contains(&code))
    }
}

/// Every failure the client core can surface to the UI layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("session rejected by backend ({code}): {message}")]
    Auth { code: String, message: String },
    #[error("streaming connection failed after {attempts} attempt(s): {reason}")]
    Connection { attempts: u32, reason: String },
    #[error("streaming connection lost: {0}")]
    ConnectionLost(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("GraphQL error: {}", summarize(.0))]
    GraphQl(Vec<GraphQlError>),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse error classes used by the fault interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Auth,
    Other,
}

impl ClientError {
    /// Build the error for a non-empty GraphQL `errors` array.
    ///
    /// Auth codes win over validation codes when a payload mixes them.
    pub fn from_graphql(errors: Vec<GraphQlError>) -> Self {
        if let Some(auth) = errors.iter().find(|err| err.is_auth()) {
            return Self::Auth {
                code: auth.code().unwrap_or_default().to_string(),
                message: auth.message.clone(),
            };
        }
        if let Some(invalid) = errors.iter().find(|err| err.is_validation()) {
            return Self::Validation(invalid.message.clone());
        }
        Self::GraphQl(errors)
    }

    /// Map a WebSocket close frame sent by the server.
    pub fn from_close(code: u16, reason: &str) -> Self {
        match code {
            4401 => Self::Auth {
                code: "unauthorized".to_string(),
                message: reason.to_string(),
            },
            4403 => Self::Auth {
                code: "forbidden".to_string(),
                message: reason.to_string(),
            },
            4400 => Self::Protocol(format!("server rejected message: {reason}")),
            _ => Self::ConnectionLost(format!("closed with code {code}: {reason}")),
        }
    }

    pub fn ack_timeout(timeout: Duration) -> Self {
        Self::Network(format!(
            "no connection_ack within {} ms",
            timeout.as_millis()
        ))
    }

    pub fn class(&self) -> FaultClass {
        match self {
            Self::Auth { .. } => FaultClass::Auth,
            _ => FaultClass::Other,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.class() == FaultClass::Auth
    }

    /// Short text suitable for an inline error banner.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth { .. } => "Your session has expired. Please sign in again.".to_string(),
            Self::Connection { .. } | Self::ConnectionLost(_) => {
                "Lost connection to the chat server.".to_string()
            }
            Self::Network(_) => "Network unavailable. Check your connection.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                Self::Auth {
                    code: "unauthorized".to_string(),
                    message: format!("handshake rejected with HTTP {}", response.status()),
                }
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::ConnectionLost("socket closed".to_string())
            }
            other => Self::Network(other.to_string()),
        }
    }
}

fn summarize(errors: &[GraphQlError]) -> String {
    match errors {
        [] => "empty error list".to_string(),
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (+{} more)", first.message, rest.len()),
    }
}
