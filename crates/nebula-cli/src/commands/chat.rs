//! Chat handler

use anyhow::{Context, Result};

use nebula_core::{ListName, SyncEngine};

use crate::commands::require_session;
use crate::output::Output;

/// Send a message if one is given, then print the conversation and mark it read
pub async fn run(
    engine: &SyncEngine,
    peer: &str,
    send: Option<String>,
    output: &Output,
) -> Result<()> {
    let session = require_session(engine).await?;
    let me = session.user_id().unwrap_or_default().to_string();
    let list = ListName::Messages(peer.to_string());

    engine
        .refresh(&list)
        .await
        .context("Failed to load conversation")?;

    if let Some(text) = send {
        engine
            .send_message(peer, &text)
            .await
            .context("Sending failed")?;
    }

    output.print_messages(&engine.messages(peer).await, &me);

    let marked = engine
        .mark_conversation_read(peer)
        .await
        .context("Failed to mark conversation read")?;
    if marked > 0 {
        output.message(&format!("Marked {} message(s) read", marked));
    }
    Ok(())
}
