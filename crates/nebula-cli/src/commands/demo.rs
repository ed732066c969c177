//! Scripted scenario against the in-memory backend
//!
//! Two users share one `MemoryBackend`: ada follows the feed live while bob
//! posts, likes and writes to her, so the realtime merge paths are visible
//! without a hosted backend.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use nebula_core::{Config, ListName, MemoryBackend, Row, Screen, SyncEngine};

use crate::output::Output;

const SETTLE: Duration = Duration::from_millis(50);

pub async fn run(output: &Output) -> Result<()> {
    let backend = MemoryBackend::new();
    let ada = backend.register("ada@example.com", "demo", "ada");
    let bob = backend.register("bob@example.com", "demo", "bob");
    backend.seed(
        "communities",
        vec![row(json!({"name": "Rustaceans", "description": "All things Rust"}))],
    );
    let config = Config {
        update_retry_delay_ms: 200,
        ..Default::default()
    };

    let ada_engine = SyncEngine::in_memory(&backend, config.clone());
    let bob_engine = SyncEngine::in_memory(&backend, config);
    ada_engine
        .sign_in("ada@example.com", "demo")
        .await
        .context("ada could not sign in")?;
    bob_engine
        .sign_in("bob@example.com", "demo")
        .await
        .context("bob could not sign in")?;

    output.message("== ada opens the home feed and notifications ==");
    ada_engine.refresh(&ListName::Feed).await?;
    ada_engine.subscribe(Screen::Home).await?;
    ada_engine.subscribe(Screen::Notifications).await?;

    output.message("== ada posts; the optimistic entry is confirmed by the server ==");
    let post = ada_engine
        .create_post("Hello from the in-memory backend!", Vec::new(), None)
        .await?;
    output.print_feed(&ada_engine.feed().await);

    output.message("== bob likes and comments; ada sees the counts arrive live ==");
    bob_engine.refresh(&ListName::Feed).await?;
    bob_engine.like_post(&post.id).await?;
    bob_engine
        .add_comment(&post.id, "Nice one, ada", None)
        .await?;
    tokio::time::sleep(SETTLE).await;
    output.print_feed(&ada_engine.feed().await);
    output.print_notifications(&ada_engine.notifications().await);

    output.message("== bob writes to ada ==");
    let chat = Screen::Chat {
        peer_id: bob.id.clone(),
    };
    ada_engine.subscribe(chat.clone()).await?;
    bob_engine.send_message(&ada.id, "Coffee later?").await?;
    tokio::time::sleep(SETTLE).await;
    ada_engine.send_message(&bob.id, "Sure!").await?;
    output.print_messages(&ada_engine.messages(&bob.id).await, &ada.id);

    output.message("== ada catches up and joins a community ==");
    let marked = ada_engine.mark_all_notifications_read().await?;
    ada_engine.mark_conversation_read(&bob.id).await?;
    ada_engine.refresh(&ListName::Communities).await?;
    if let Some(community) = ada_engine.communities().await.first() {
        ada_engine.join_community(&community.id).await?;
    }
    output.print_communities(
        &ada_engine.communities().await,
        &ada_engine.joined_communities().await,
    );
    output.success(&format!("Marked {} notification(s) read", marked));

    output.message("== ada signs out; everything is cleared ==");
    ada_engine.unsubscribe(&chat).await;
    ada_engine.sign_out().await?;
    output.print_feed(&ada_engine.feed().await);
    output.success("Demo complete");
    Ok(())
}

fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}
