//! Feed and community handlers

use anyhow::{Context, Result};

use nebula_core::{ListName, LoadOutcome, SyncEngine};

use crate::commands::require_session;
use crate::output::Output;

/// Load `pages` pages of the home feed and print it
pub async fn show(engine: &SyncEngine, pages: usize, output: &Output) -> Result<()> {
    engine
        .refresh(&ListName::Feed)
        .await
        .context("Failed to load feed")?;

    for _ in 1..pages {
        match engine
            .load_more(&ListName::Feed)
            .await
            .context("Failed to load more posts")?
        {
            LoadOutcome::Loaded { has_more: true, .. } => {}
            _ => break,
        }
    }

    output.print_feed(&engine.feed().await);
    if engine.cursor(&ListName::Feed).await.has_more {
        output.message(&format!("More posts available (try --pages {})", pages + 1));
    }
    Ok(())
}

/// List communities, optionally joining or leaving one first
pub async fn communities(
    engine: &SyncEngine,
    join: Option<String>,
    leave: Option<String>,
    output: &Output,
) -> Result<()> {
    if join.is_some() || leave.is_some() {
        require_session(engine).await?;
    }

    if let Some(ref id) = join {
        if engine
            .join_community(id)
            .await
            .context("Failed to join community")?
        {
            output.success(&format!("Joined {}", id));
        } else {
            output.message(&format!("Already a member of {}", id));
        }
    }
    if let Some(ref id) = leave {
        if engine
            .leave_community(id)
            .await
            .context("Failed to leave community")?
        {
            output.success(&format!("Left {}", id));
        } else {
            output.message(&format!("Not a member of {}", id));
        }
    }

    engine
        .refresh(&ListName::Communities)
        .await
        .context("Failed to load communities")?;
    output.print_communities(
        &engine.communities().await,
        &engine.joined_communities().await,
    );
    Ok(())
}
