use crate::auth::CredentialProvider;
use crate::error::{ClientError, FaultClass};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Read-only observer of router errors.
///
/// Auth-class errors trigger a sign-out; everything else is only logged.
/// The error itself always flows on to the caller untouched.
#[derive(Clone)]
pub struct FaultInterceptor {
    provider: Arc<dyn CredentialProvider>,
    observed: Arc<AtomicUsize>,
}

impl FaultInterceptor {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            observed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Errors seen so far, shared across clones.
    pub fn observed(&self) -> usize {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn observe(&self, err: &ClientError) -> FaultClass {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let class = err.class();
        match class {
            FaultClass::Auth => {
                warn!(error = %err, "auth error detected, signing out");
                self.provider.sign_out();
            }
            FaultClass::Other => {
                if let ClientError::Http { status: 401, .. } = err {
                    warn!("HTTP 401 without GraphQL payload; credential provider should refresh");
                } else {
                    error!(error = %err, "operation failed");
                }
            }
        }
        class
    }

    /// Observe a result in passing and hand it back unchanged.
    pub fn inspect<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(err) = &result {
            self.observe(err);
        }
        result
    }
}
