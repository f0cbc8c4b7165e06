use super::{GraphQlResponse, UnaryChannel};
use crate::auth::AuthHeaders;
use crate::error::ClientError;
use crate::operation::Operation;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

/// GraphQL over HTTP `POST`.
#[derive(Clone)]
pub struct HttpChannel {
    client: Client,
    endpoint: Url,
}

impl HttpChannel {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl UnaryChannel for HttpChannel {
    async fn execute(
        &self,
        operation: &Operation,
        headers: &AuthHeaders,
    ) -> Result<GraphQlResponse, ClientError> {
        debug!(
            operation = operation.name().unwrap_or("anonymous"),
            kind = ?operation.kind(),
            "sending GraphQL request"
        );
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(to_header_map(headers)?)
            .header(CONTENT_TYPE, "application/json")
            .json(&operation.payload())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_body(status, &body)
    }
}

/// GraphQL servers may put an `errors` payload on non-2xx responses; prefer
/// it over the bare status when present.
fn parse_body(status: StatusCode, body: &str) -> Result<GraphQlResponse, ClientError> {
    match serde_json::from_str::<GraphQlResponse>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.into_result(),
        _ if !status.is_success() => Err(ClientError::Http {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        }),
        Ok(parsed) => Ok(parsed),
        Err(err) => Err(ClientError::Decode(err.to_string())),
    }
}

fn to_header_map(headers: &AuthHeaders) -> Result<HeaderMap, ClientError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ClientError::Validation(format!("invalid header name {name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| ClientError::Validation(format!("invalid value for {name}: {err}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
