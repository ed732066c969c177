//! Live watch handler

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use nebula_core::{ListName, Screen, StoreEvent, SyncEngine};

use crate::output::{Output, OutputFormat};

/// Follow the feed (and notifications when signed in) until Ctrl-C
pub async fn run(engine: &SyncEngine, output: &Output) -> Result<()> {
    let signed_in = engine.session().await.authenticated;
    let mut events = engine.store_events().await;
    let auth_watch = engine.watch_auth();

    engine
        .refresh(&ListName::Feed)
        .await
        .context("Failed to load feed")?;
    engine
        .subscribe(Screen::Home)
        .await
        .context("Failed to subscribe to the feed")?;
    if signed_in {
        engine
            .refresh(&ListName::Notifications)
            .await
            .context("Failed to load notifications")?;
        engine
            .subscribe(Screen::Notifications)
            .await
            .context("Failed to subscribe to notifications")?;
    }

    output.print_feed(&engine.feed().await);
    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => report(engine, &event, output).await,
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} store events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.unsubscribe(&Screen::Home).await;
    engine.unsubscribe(&Screen::Notifications).await;
    auth_watch.abort();
    Ok(())
}

async fn report(engine: &SyncEngine, event: &StoreEvent, output: &Output) {
    if output.format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "event": format!("{:?}", event) })
        );
        return;
    }

    match event {
        StoreEvent::ListChanged(ListName::Feed) => {
            if let Some(newest) = engine.feed().await.first() {
                output.message(&format!(
                    "feed: {} posts, newest {} ({} likes)",
                    engine.feed().await.len(),
                    newest.id,
                    newest.like_count
                ));
            }
        }
        StoreEvent::ListChanged(ListName::Notifications) => {
            output.message(&format!(
                "notifications: {} unread",
                engine.unread_count().await
            ));
        }
        StoreEvent::SessionCleared => output.message("session ended"),
        StoreEvent::SessionChanged { authenticated } => {
            output.message(&format!("session changed (signed in: {})", authenticated))
        }
        other => output.message(&format!("{:?}", other)),
    }
}
