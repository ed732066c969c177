//! Search, follow and profile stats handlers

use anyhow::{Context, Result};
use clap::ValueEnum;

use nebula_core::{SearchScope, SyncEngine};

use crate::commands::require_session;
use crate::output::Output;

/// What `nebula search` looks through
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ScopeArg {
    #[default]
    All,
    Users,
    Posts,
    Communities,
}

impl From<ScopeArg> for SearchScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::All => SearchScope::All,
            ScopeArg::Users => SearchScope::Users,
            ScopeArg::Posts => SearchScope::Posts,
            ScopeArg::Communities => SearchScope::Communities,
        }
    }
}

/// Print one page of search results (pages start at 1)
pub async fn search(
    engine: &SyncEngine,
    query: &str,
    scope: ScopeArg,
    page: usize,
    output: &Output,
) -> Result<()> {
    let results = engine
        .search(query, scope.into(), page.saturating_sub(1))
        .await
        .context("Search failed")?;
    output.print_search(&results);
    Ok(())
}

pub async fn follow(
    engine: &SyncEngine,
    user_id: &str,
    unfollow: bool,
    output: &Output,
) -> Result<()> {
    require_session(engine).await?;

    if unfollow {
        if engine
            .unfollow_user(user_id)
            .await
            .context("Failed to unfollow user")?
        {
            output.success(&format!("Unfollowed {}", user_id));
        } else {
            output.message(&format!("Not following {}", user_id));
        }
    } else if engine
        .follow_user(user_id)
        .await
        .context("Failed to follow user")?
    {
        output.success(&format!("Following {}", user_id));
    } else {
        output.message(&format!("Already following {}", user_id));
    }
    Ok(())
}

/// Show counters of a user, the signed-in user by default
pub async fn stats(engine: &SyncEngine, user_id: Option<String>, output: &Output) -> Result<()> {
    let user_id = match user_id {
        Some(id) => id,
        None => require_session(engine)
            .await?
            .user_id()
            .map(str::to_string)
            .context("Session has no user")?,
    };
    let stats = engine
        .user_stats(&user_id)
        .await
        .context("Failed to load stats")?;
    output.print_stats(&user_id, &stats);
    Ok(())
}
