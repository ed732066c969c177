//! Notifications handler

use anyhow::{Context, Result};

use nebula_core::{ListName, SyncEngine};

use crate::commands::require_session;
use crate::output::Output;

pub async fn show(engine: &SyncEngine, read_all: bool, output: &Output) -> Result<()> {
    require_session(engine).await?;
    engine
        .refresh(&ListName::Notifications)
        .await
        .context("Failed to load notifications")?;

    if read_all {
        let marked = engine
            .mark_all_notifications_read()
            .await
            .context("Failed to mark notifications read")?;
        output.success(&format!("Marked {} notification(s) read", marked));
    }

    output.print_notifications(&engine.notifications().await);
    Ok(())
}
