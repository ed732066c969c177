//! Password auth against the hosted auth service
//!
//! The session is kept in the shared `Credentials` so every other remote
//! client signs its requests with the current user token. When a path is
//! given the session is also written to disk and restored on startup.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{check, RestContext};
use crate::error::{SyncError, SyncResult};
use crate::models::User;
use crate::provider::{AuthChange, AuthEvent, AuthProvider, AuthSession};

/// Refresh this long before the access token expires
const REFRESH_MARGIN_SECS: i64 = 60;

/// Token response from the auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => chrono::DateTime::from_timestamp(at, 0),
            (None, Some(secs)) => Some(Utc::now() + Duration::seconds(secs)),
            (None, None) => None,
        };
        AuthSession {
            user: User {
                id: self.user.id,
                email: self.user.email,
            },
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Auth provider for the hosted auth service
pub struct GoTrueAuth {
    rest: RestContext,
    session_path: Option<PathBuf>,
    changes: broadcast::Sender<AuthChange>,
}

impl GoTrueAuth {
    /// Create the provider, restoring a saved session if one exists
    pub fn new(rest: RestContext, session_path: Option<PathBuf>) -> Result<Self> {
        if let Some(ref path) = session_path {
            if path.exists() {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let session: AuthSession = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                debug!("Restored auth session for {}", session.user.id);
                rest.credentials.set(Some(session));
            }
        }

        let (changes, _) = broadcast::channel(16);
        Ok(Self {
            rest,
            session_path,
            changes,
        })
    }

    fn store(&self, session: Option<AuthSession>) -> SyncResult<()> {
        if let Some(ref path) = self.session_path {
            match session {
                Some(ref session) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| SyncError::Storage(e.to_string()))?;
                    }
                    let contents = serde_json::to_string_pretty(session)?;
                    fs::write(path, contents).map_err(|e| SyncError::Storage(e.to_string()))?;
                }
                None if path.exists() => {
                    fs::remove_file(path).map_err(|e| SyncError::Storage(e.to_string()))?;
                }
                None => {}
            }
        }
        self.rest.credentials.set(session);
        Ok(())
    }

    fn notify(&self, event: AuthEvent, session: Option<AuthSession>) {
        let _ = self.changes.send(AuthChange { event, session });
    }

    async fn token_grant(&self, grant: &str, body: serde_json::Value) -> SyncResult<AuthSession> {
        let url = self.rest.url("/auth/v1/token");
        let response = self
            .rest
            .http
            .post(url)
            .query(&[("grant_type", grant)])
            .header("apikey", &self.rest.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json::<TokenResponse>().await?.into_session())
    }

    async fn refresh(&self, session: &AuthSession) -> SyncResult<Option<AuthSession>> {
        let Some(ref refresh_token) = session.refresh_token else {
            return Ok(Some(session.clone()));
        };

        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(refreshed) => {
                debug!("Refreshed access token for {}", refreshed.user.id);
                self.store(Some(refreshed.clone()))?;
                self.notify(AuthEvent::TokenRefreshed, Some(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(SyncError::Network(e)) => {
                // Keep the old token; the next call retries the refresh
                warn!("Token refresh failed: {}", e);
                Ok(Some(session.clone()))
            }
            Err(e) => {
                info!("Session could not be refreshed ({}), signing out", e);
                self.store(None)?;
                self.notify(AuthEvent::SignedOut, None);
                Ok(None)
            }
        }
    }
}

fn needs_refresh(session: &AuthSession) -> bool {
    session
        .expires_at
        .is_some_and(|at| at - Duration::seconds(REFRESH_MARGIN_SECS) <= Utc::now())
}

#[async_trait]
impl AuthProvider for GoTrueAuth {
    async fn get_session(&self) -> SyncResult<Option<AuthSession>> {
        match self.rest.credentials.get() {
            Some(session) if needs_refresh(&session) => self.refresh(&session).await,
            other => Ok(other),
        }
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> SyncResult<AuthSession> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        self.store(Some(session.clone()))?;
        info!("Signed in as {}", session.user.id);
        self.notify(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> SyncResult<()> {
        if self.rest.credentials.get().is_some() {
            let url = self.rest.url("/auth/v1/logout");
            let result = self.rest.authorize(self.rest.http.post(url)).send().await;
            // The local session ends even when the server call fails
            match result {
                Ok(response) => {
                    if let Err(e) = check(response).await {
                        debug!("Logout rejected by server: {}", e);
                    }
                }
                Err(e) => debug!("Logout request failed: {}", e),
            }
        }
        self.store(None)?;
        self.notify(AuthEvent::SignedOut, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Credentials;
    use tempfile::TempDir;

    fn session(expires_in: i64) -> AuthSession {
        AuthSession {
            user: User::new("u1"),
            access_token: "jwt".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
        }
    }

    fn rest() -> RestContext {
        RestContext::new("http://127.0.0.1:9", "anon", Credentials::default())
    }

    #[test]
    fn test_token_response_into_session() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "jwt",
            "refresh_token": "r1",
            "expires_in": 3600,
            "user": {"id": "u1", "email": "a@example.com"}
        }))
        .unwrap();
        let session = response.into_session();
        assert_eq!(session.user.id, "u1");
        assert_eq!(session.user.email.as_deref(), Some("a@example.com"));
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert!(session.expires_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_needs_refresh() {
        assert!(needs_refresh(&session(30)));
        assert!(!needs_refresh(&session(3600)));
    }

    #[test]
    fn test_session_persisted_and_restored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth_session.json");

        let auth = GoTrueAuth::new(rest(), Some(path.clone())).unwrap();
        auth.store(Some(session(3600))).unwrap();
        assert!(path.exists());

        let credentials = Credentials::default();
        let rest = RestContext::new("http://127.0.0.1:9", "anon", credentials.clone());
        let _restored = GoTrueAuth::new(rest, Some(path.clone())).unwrap();
        assert_eq!(credentials.access_token().as_deref(), Some("jwt"));
    }

    #[tokio::test]
    async fn test_sign_out_clears_local_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth_session.json");
        let auth = GoTrueAuth::new(rest(), Some(path.clone())).unwrap();
        auth.store(Some(session(3600))).unwrap();
        let mut changes = auth.on_auth_state_change();

        // Server is unreachable; sign-out still ends the local session
        auth.sign_out().await.unwrap();
        assert!(!path.exists());
        assert!(auth.get_session().await.unwrap().is_none());
        assert_eq!(changes.recv().await.unwrap().event, AuthEvent::SignedOut);
    }

    #[test]
    fn test_corrupt_session_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth_session.json");
        fs::write(&path, "not json").unwrap();
        assert!(GoTrueAuth::new(rest(), Some(path)).is_err());
    }
}
