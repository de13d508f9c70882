//! Connectivity probe against the backend host.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::error::{RecoveryError, Result};

/// Cheap reachability check, independent of any retry state.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Ok(())` when the backend answered healthily.
    async fn probe(&self) -> Result<()>;
}

/// Issues a minimal GET against a known backend endpoint.
///
/// Only a 2xx answer counts as reachable; an auth rejection or server error
/// means the data calls would fail too.
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpConnectivityProbe {
    pub fn new(client: reqwest::Client, backend: &BackendConfig) -> Self {
        Self {
            client,
            url: backend.endpoint(&backend.probe_path),
            api_key: backend.anon_key.clone(),
            timeout: Duration::from_millis(backend.request_timeout_ms),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn probe(&self) -> Result<()> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RecoveryError::Unhealthy(status.as_u16()))
        }
    }
}
