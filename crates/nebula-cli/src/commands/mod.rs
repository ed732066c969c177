//! Command handlers

pub mod auth;
pub mod chat;
pub mod config;
pub mod demo;
pub mod feed;
pub mod notifications;
pub mod people;
pub mod post;
pub mod status;
pub mod watch;

use anyhow::{bail, Context, Result};

use nebula_core::{Config, Session, SyncEngine};

/// Open the engine against the configured backend and confirm the saved session
pub async fn open_engine(config: Config) -> Result<SyncEngine> {
    if !config.has_backend() {
        bail!(
            "Backend not configured. Set it with:\n  \
             nebula config set backend_url https://your-project.supabase.co\n  \
             nebula config set anon_key <anon key>\n\
             Or try `nebula demo` to run against an in-memory backend."
        );
    }
    let engine = SyncEngine::open(config).context("Failed to start sync engine")?;
    engine
        .restore_session()
        .await
        .context("Failed to restore session")?;
    Ok(engine)
}

/// The current session, or an error telling the user to sign in
pub async fn require_session(engine: &SyncEngine) -> Result<Session> {
    let session = engine.session().await;
    if !session.authenticated {
        bail!("Not signed in. Run `nebula login <email>` first.");
    }
    Ok(session)
}
