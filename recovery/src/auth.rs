//! Session refresh used as the recovery action for authentication failures.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::BackendConfig;
use crate::error::{RecoveryError, Result};

/// Backend session as held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

/// Shared slot holding the current session, if any.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(session))),
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, session: Session) {
        *self.inner.write().await = Some(session);
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// Establishes a fresh session with the backend.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    /// Returns the new session, or an error when none could be established.
    async fn refresh(&self) -> Result<Session>;
}

/// Token payload returned by the refresh endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Refreshes the session against the backend's token endpoint.
///
/// POSTs the stored refresh token as `{"refresh_token": ...}` and stores the
/// returned session in the shared [`SessionStore`].
pub struct HttpSessionRefresher {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    store: SessionStore,
}

impl HttpSessionRefresher {
    pub fn new(client: reqwest::Client, backend: &BackendConfig, store: SessionStore) -> Self {
        Self {
            client,
            url: backend.endpoint(&backend.refresh_path),
            api_key: backend.anon_key.clone(),
            store,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }
}

#[async_trait]
impl SessionRefresher for HttpSessionRefresher {
    async fn refresh(&self) -> Result<Session> {
        let refresh_token = self
            .store
            .current()
            .await
            .and_then(|session| session.refresh_token)
            .ok_or(RecoveryError::NoSession)?;

        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RecoveryError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RecoveryError::InvalidResponse(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(RecoveryError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        let session = Session {
            access_token: token.access_token,
            // Some backends rotate refresh tokens, some don't.
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        };
        self.store.set(session.clone()).await;
        tracing::debug!("session refreshed via {}", self.url);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_check() {
        let mut session = Session::new("a", None);
        assert!(!session.is_expired());
        session.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(session.is_expired());
        session.expires_at = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn store_set_and_clear() {
        let store = SessionStore::new();
        assert!(store.current().await.is_none());

        store.set(Session::new("a", Some("r".to_string()))).await;
        let clone = store.clone();
        assert_eq!(
            clone.current().await.map(|s| s.access_token),
            Some("a".to_string())
        );

        clone.clear().await;
        assert!(store.current().await.is_none());
    }

    #[tokio::test]
    async fn refresh_without_session_fails_fast() {
        let backend = BackendConfig {
            // Nothing listens here; the call must not get that far.
            url: "http://127.0.0.1:9".to_string(),
            ..BackendConfig::default()
        };
        let refresher =
            HttpSessionRefresher::new(reqwest::Client::new(), &backend, SessionStore::new());
        assert!(matches!(
            refresher.refresh().await,
            Err(RecoveryError::NoSession)
        ));
    }
}
