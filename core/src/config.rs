use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// How often the chat list is refreshed when nothing else asks for it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Nhost,
    Mock,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nhost" => Ok(Self::Nhost),
            "mock" => Ok(Self::Mock),
            other => Err(ConfigError::Invalid(format!("unknown backend `{other}`"))),
        }
    }
}

/// The GraphQL endpoint over both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub http: Url,
    pub ws: Url,
}

impl Endpoints {
    /// Derive the WebSocket URL by swapping `https` for `wss` (`http` for `ws`).
    pub fn from_graphql_url(raw: &str) -> Result<Self, ConfigError> {
        let http = Url::parse(raw.trim())
            .map_err(|err| ConfigError::Invalid(format!("invalid graphql_url `{raw}`: {err}")))?;
        let scheme = match http.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ConfigError::Invalid(format!(
                    "graphql_url must be http or https, got `{other}`"
                )))
            }
        };
        let mut ws = http.clone();
        ws.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot derive websocket url from `{raw}`")))?;
        Ok(Self { http, ws })
    }

    pub fn nhost(subdomain: &str, region: &str) -> Result<Self, ConfigError> {
        Self::from_graphql_url(&format!(
            "https://{subdomain}.graphql.{region}.nhost.run/v1"
        ))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Backend not configured. Create parley.yaml or set NHOST_SUBDOMAIN.")]
    Missing,
    #[error("Configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Backend not configured. Create parley.yaml or set NHOST_SUBDOMAIN.".to_string()
            }
            Self::Invalid(detail) => format!("Backend not configured: {detail}. Update parley.yaml."),
        }
    }
}

/// Resolved runtime settings for the client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub backend: BackendKind,
    /// `None` for the mock backend.
    pub endpoints: Option<Endpoints>,
    pub access_token: Option<String>,
    pub user_id: Option<Uuid>,
    pub poll_interval: Duration,
}

impl ClientSettings {
    /// Settings for an in-process backend with no network.
    pub fn mock() -> Self {
        Self {
            backend: BackendKind::Mock,
            endpoints: None,
            access_token: Some("mock-token".to_string()),
            user_id: Some(Uuid::nil()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Read `.env`, the first `parley.yaml` found and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => Some(read_config(&path)?),
            None => None,
        };
        resolve(file.unwrap_or_default(), EnvOverrides::from_env())
    }

    /// Like `load`, but the file must exist at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "{} does not exist",
                path.display()
            )));
        }
        resolve(read_config(path)?, EnvOverrides::from_env())
    }
}

/// Environment values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub backend: Option<String>,
    pub graphql_url: Option<String>,
    pub subdomain: Option<String>,
    pub region: Option<String>,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            backend: var("PARLEY_BACKEND"),
            graphql_url: var("PARLEY_GRAPHQL_URL"),
            subdomain: var("NHOST_SUBDOMAIN"),
            region: var("NHOST_REGION"),
            access_token: var("PARLEY_ACCESS_TOKEN"),
            user_id: var("PARLEY_USER_ID"),
        }
    }
}

/// Merge file sections with environment overrides.
pub fn resolve(file: ParleyConfig, env: EnvOverrides) -> Result<ClientSettings, ConfigError> {
    let backend_section = file.backend.unwrap_or_default();
    let session = file.session.unwrap_or_default();
    let chat_list = file.chat_list.unwrap_or_default();

    let backend = match env.backend.as_deref() {
        Some(raw) => BackendKind::parse(raw)?,
        None => backend_section.kind.unwrap_or(BackendKind::Nhost),
    };
    let poll_interval = chat_list
        .poll_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    if poll_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "chat_list.poll_interval_ms must be positive".to_string(),
        ));
    }
    let user_id = match env.user_id.or(session.user_id) {
        Some(raw) => Some(
            Uuid::parse_str(raw.trim())
                .map_err(|err| ConfigError::Invalid(format!("invalid user_id: {err}")))?,
        ),
        None => None,
    };
    let access_token = env
        .access_token
        .or(session.access_token)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    if backend == BackendKind::Mock {
        let mock = ClientSettings::mock();
        return Ok(ClientSettings {
            access_token: access_token.or(mock.access_token),
            user_id: user_id.or(mock.user_id),
            poll_interval,
            ..mock
        });
    }

    let explicit = env.graphql_url.or(backend_section.graphql_url);
    let endpoints = match explicit {
        Some(url) => Endpoints::from_graphql_url(&url)?,
        None => {
            let subdomain = env
                .subdomain
                .or(backend_section.subdomain)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::Missing)?;
            let region = env
                .region
                .or(backend_section.region)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ConfigError::Invalid("missing nhost region".to_string())
                })?;
            Endpoints::nhost(&subdomain, &region)?
        }
    };
    debug!(http = %endpoints.http, "resolved backend endpoints");

    Ok(ClientSettings {
        backend,
        endpoints: Some(endpoints),
        access_token,
        user_id,
        poll_interval,
    })
}

fn read_config(path: &Path) -> Result<ParleyConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid parley.yaml: {err}")))
}

fn locate_config_file() -> Option<PathBuf> {
    parley_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn parley_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parley");
        paths.push(config_dir.join("parley.yaml"));
        paths.push(config_dir.join("parley.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".parley").join("parley.yaml"));
        paths.push(home_dir.join(".parley").join("parley.yml"));
    } else {
        paths.push(PathBuf::from("parley.yaml"));
        paths.push(PathBuf::from("parley.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfig {
    backend: Option<BackendSection>,
    session: Option<SessionSection>,
    chat_list: Option<ChatListSection>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendSection {
    kind: Option<BackendKind>,
    subdomain: Option<String>,
    region: Option<String>,
    graphql_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionSection {
    access_token: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatListSection {
    poll_interval_ms: Option<u64>,
}
