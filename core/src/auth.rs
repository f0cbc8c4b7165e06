use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Header name to value, as handed to the transports.
pub type AuthHeaders = BTreeMap<String, String>;

/// Owner of the session: the only component allowed to mutate it.
pub trait CredentialProvider: Send + Sync {
    /// Headers for the session as it stands right now.
    fn current_headers(&self) -> AuthHeaders;

    /// End the session. Calling it again is harmless.
    fn sign_out(&self);
}

/// Session token with an optional expiry, as issued by the auth service.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthState {
    pub fn signed_in(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            expires_at,
        }
    }

    pub fn signed_out() -> Self {
        Self {
            access_token: None,
            expires_at: None,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        match (self.access_token.as_ref(), self.expires_at) {
            (Some(_), Some(exp)) => Utc::now() + Duration::minutes(1) >= exp,
            (Some(_), None) => false,
            _ => true,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.access_token.is_some()
    }

    fn headers(&self) -> AuthHeaders {
        let mut headers = AuthHeaders::new();
        if let Some(token) = &self.access_token {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        headers
    }
}

/// Bearer-token session held in memory.
#[derive(Clone)]
pub struct SessionCredentials {
    state: Arc<RwLock<AuthState>>,
    signed_in_tx: Arc<watch::Sender<bool>>,
    sign_outs: Arc<AtomicUsize>,
}

impl SessionCredentials {
    pub fn new(state: AuthState) -> Self {
        let (signed_in_tx, _) = watch::channel(state.is_signed_in());
        Self {
            state: Arc::new(RwLock::new(state)),
            signed_in_tx: Arc::new(signed_in_tx),
            sign_outs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self::new(AuthState::signed_in(token, None))
    }

    /// Swap in a refreshed token; the next header pull picks it up.
    pub fn replace_token(&self, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        *self.state.write() = AuthState::signed_in(token, expires_at);
        self.signed_in_tx.send_replace(true);
    }

    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.state.read().is_signed_in()
    }

    /// Watch the signed-in flag; flips to `false` on sign-out.
    pub fn watch_signed_in(&self) -> watch::Receiver<bool> {
        self.signed_in_tx.subscribe()
    }

    /// How many times `sign_out` has been invoked over the session's life.
    pub fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for SessionCredentials {
    fn current_headers(&self) -> AuthHeaders {
        self.state.read().headers()
    }

    fn sign_out(&self) {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        let was_signed_in = {
            let mut state = self.state.write();
            let was = state.is_signed_in();
            *state = AuthState::signed_out();
            was
        };
        if was_signed_in {
            info!("session signed out");
        }
        self.signed_in_tx.send_replace(false);
    }
}

/// Pulls fresh headers from the provider for every call and connection.
#[derive(Clone)]
pub struct CredentialInjector {
    provider: Arc<dyn CredentialProvider>,
}

impl CredentialInjector {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self { provider }
    }

    pub fn current_headers(&self) -> AuthHeaders {
        self.provider.current_headers()
    }

    /// Merge current auth headers over headers already on a request.
    pub fn attach(&self, mut headers: AuthHeaders) -> AuthHeaders {
        headers.extend(self.current_headers());
        headers
    }

    pub fn provider(&self) -> &Arc<dyn CredentialProvider> {
        &self.provider
    }
}
