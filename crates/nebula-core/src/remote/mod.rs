//! Hosted backend providers
//!
//! REST clients for the data, auth and storage services plus the realtime
//! websocket client, all sharing one HTTP client and the signed-in
//! credentials.

mod auth;
mod data;
mod storage;

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

pub use auth::GoTrueAuth;
pub use data::{encode_filter, PostgrestData};
pub use storage::StorageClient;

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::provider::{AuthSession, Providers};
use crate::realtime::{RealtimeClient, RealtimeConfig};

/// Credentials shared by every remote client
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    session: Arc<RwLock<Option<AuthSession>>>,
}

impl Credentials {
    pub fn get(&self) -> Option<AuthSession> {
        self.session
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set(&self, session: Option<AuthSession>) {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        *guard = session;
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|s| s.access_token)
    }
}

/// Base URL, API key and credentials for REST calls
#[derive(Debug, Clone)]
pub struct RestContext {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    credentials: Credentials,
}

impl RestContext {
    pub fn new(base_url: &str, api_key: &str, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the API key and the bearer token (user token or API key)
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .credentials
            .access_token()
            .unwrap_or_else(|| self.api_key.clone());
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }
}

/// Error body returned by the REST services
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Turn a non-success response into a classified `SyncError`
async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = body
        .message
        .or(body.error_description)
        .or(body.msg)
        .or(body.error)
        .unwrap_or_else(|| text.clone());
    debug!("Backend returned {}: {}", status, message);

    let code = body.code.map(|code| match code {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });
    // Unrecognized backend codes fall back to the HTTP status
    Err(match code.map(|code| SyncError::from_backend(&code, message.clone())) {
        Some(SyncError::Backend { .. }) | None => {
            SyncError::from_status(status.as_u16(), message)
        }
        Some(classified) => classified,
    })
}

/// Build the remote providers from configuration
pub fn connect(config: &Config) -> Result<Providers> {
    let base_url = config
        .backend_url
        .as_deref()
        .context("backend_url is not configured (set NEBULA_BACKEND_URL)")?;
    let api_key = config
        .anon_key
        .as_deref()
        .context("anon_key is not configured (set NEBULA_ANON_KEY)")?;

    let credentials = Credentials::default();
    let rest = RestContext::new(base_url, api_key, credentials.clone());

    let auth = GoTrueAuth::new(rest.clone(), Some(config.auth_session_path()))
        .context("Failed to load auth session")?;
    let data = PostgrestData::new(rest.clone());
    let storage = StorageClient::new(rest, &config.storage_bucket);

    let realtime_config =
        RealtimeConfig::from_config(config).context("realtime endpoint is not configured")?;
    let token_credentials = credentials;
    let realtime = RealtimeClient::new(
        realtime_config,
        Arc::new(move || token_credentials.access_token()),
    );

    Ok(Providers {
        auth: Arc::new(auth),
        data: Arc::new(data),
        realtime: Arc::new(realtime),
        storage: Arc::new(storage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    #[test]
    fn test_credentials_shared_between_clones() {
        let credentials = Credentials::default();
        let clone = credentials.clone();
        assert!(clone.access_token().is_none());

        credentials.set(Some(AuthSession {
            user: User::new("u1"),
            access_token: "jwt".to_string(),
            refresh_token: None,
            expires_at: None,
        }));
        assert_eq!(clone.access_token().as_deref(), Some("jwt"));
    }

    #[test]
    fn test_connect_requires_backend() {
        assert!(connect(&Config::default()).is_err());
    }

    #[test]
    fn test_connect_with_backend() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            backend_url: Some("https://abc.supabase.co".to_string()),
            anon_key: Some("anon".to_string()),
            ..Default::default()
        };
        assert!(connect(&config).is_ok());
    }
}
