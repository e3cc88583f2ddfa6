// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::TransportError;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use std::{future::Future, pin::Pin};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Credentials are refreshed once they are this close to expiring.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    /// Present for short-lived STS credentials.
    pub security_token: Option<String>,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("security_token", &self.security_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Credentials handed out by a resolver, with the instant they stop being valid.
#[derive(Debug, Clone)]
pub struct ExpiringCredentials {
    pub credentials: Credentials,
    /// `None` for credentials that never expire.
    pub expires_at: Option<SystemTime>,
}

impl ExpiringCredentials {
    fn is_fresh(&self, now: SystemTime) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => now + REFRESH_MARGIN < expires_at,
        }
    }
}

pub type CredentialsResolverFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<ExpiringCredentials, String>> + Send>>
        + Send
        + Sync,
>;

/// Supplies the signing material the transport attaches to each request.
#[derive(Clone)]
pub enum CredentialsProvider {
    Static(Credentials),
    /// Resolved on the first request and again whenever the cached value nears expiry.
    Dynamic {
        resolver_fn: CredentialsResolverFn,
        cached: Arc<Mutex<Option<ExpiringCredentials>>>,
    },
}

impl CredentialsProvider {
    pub fn new_from_resolver(resolver_fn: CredentialsResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    pub fn new_from_static(credentials: Credentials) -> Self {
        Self::Static(credentials)
    }

    /// Provider for endpoints that accept unsigned writes.
    pub fn anonymous() -> Self {
        Self::Static(Credentials::default())
    }

    /// Current credentials. A failed refresh falls back to the cached value
    /// and only errors when nothing was ever resolved.
    pub async fn get_credentials(&self) -> Result<Credentials, TransportError> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::Dynamic {
                resolver_fn,
                cached,
            } => {
                // Held across the resolver call so concurrent senders refresh once.
                let mut cached = cached.lock().await;
                if let Some(current) = cached.as_ref() {
                    if current.is_fresh(SystemTime::now()) {
                        return Ok(current.credentials.clone());
                    }
                }

                match (resolver_fn)().await {
                    Ok(resolved) => {
                        debug!(
                            "PRODUCER | Resolved credentials for {} expiring at {:?}",
                            resolved.credentials.access_key_id, resolved.expires_at
                        );
                        let credentials = resolved.credentials.clone();
                        *cached = Some(resolved);
                        Ok(credentials)
                    }
                    Err(e) => match cached.as_ref() {
                        Some(stale) => {
                            warn!(
                                "PRODUCER | Failed to refresh credentials, reusing cached ones: {e}"
                            );
                            Ok(stale.credentials.clone())
                        }
                        None => Err(TransportError::network(format!(
                            "failed to resolve credentials: {e}"
                        ))),
                    },
                }
            }
        }
    }
}

impl Debug for CredentialsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialsProvider")
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sts(id: &str) -> Credentials {
        Credentials {
            access_key_id: id.to_string(),
            access_key_secret: "sts-secret".to_string(),
            security_token: Some("token".to_string()),
        }
    }

    /// Resolver that counts its calls and hands out credentials valid for `lifetime`.
    fn resolver(
        calls: &Arc<AtomicUsize>,
        lifetime: Option<Duration>,
        fail_after: usize,
    ) -> CredentialsResolverFn {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if call > fail_after {
                    return Err("sts endpoint unavailable".to_string());
                }
                Ok(ExpiringCredentials {
                    credentials: sts(&format!("sts-id-{call}")),
                    expires_at: lifetime.map(|lifetime| SystemTime::now() + lifetime),
                })
            })
        })
    }

    #[tokio::test]
    async fn new_from_resolver() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CredentialsProvider::new_from_resolver(resolver(
            &calls,
            Some(Duration::from_secs(3600)),
            usize::MAX,
        ));
        let credentials = provider.get_credentials().await.unwrap();
        assert_eq!(credentials.access_key_id, "sts-id-1");
        assert_eq!(credentials.security_token.as_deref(), Some("token"));
        assert_eq!(
            provider.get_credentials().await.unwrap().access_key_id,
            "sts-id-1"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_credentials_close_to_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CredentialsProvider::new_from_resolver(resolver(
            &calls,
            Some(REFRESH_MARGIN / 2),
            usize::MAX,
        ));
        assert_eq!(
            provider.get_credentials().await.unwrap().access_key_id,
            "sts-id-1"
        );
        assert_eq!(
            provider.get_credentials().await.unwrap().access_key_id,
            "sts-id-2"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn credentials_without_expiry_are_resolved_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CredentialsProvider::new_from_resolver(resolver(&calls, None, usize::MAX));
        for _ in 0..3 {
            provider.get_credentials().await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_reuses_cached_credentials() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider =
            CredentialsProvider::new_from_resolver(resolver(&calls, Some(Duration::ZERO), 1));
        assert_eq!(
            provider.get_credentials().await.unwrap().access_key_id,
            "sts-id-1"
        );
        assert_eq!(
            provider.get_credentials().await.unwrap().access_key_id,
            "sts-id-1"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_first_resolution_is_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CredentialsProvider::new_from_resolver(resolver(&calls, None, 0));
        let err = provider.get_credentials().await.unwrap_err();
        assert!(err.message.contains("sts endpoint unavailable"));
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn new_from_static() {
        let provider = CredentialsProvider::new_from_static(Credentials {
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
            security_token: None,
        });
        assert_eq!(provider.get_credentials().await.unwrap().access_key_id, "id");
    }

    #[test]
    fn debug_hides_secrets() {
        let credentials = Credentials {
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
            security_token: Some("token".to_string()),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("\"secret\""));
        assert!(!rendered.contains("\"token\""));
        assert!(rendered.contains("***"));
    }
}
