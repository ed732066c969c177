//! Status command handler

use anyhow::Result;

use nebula_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Show session, backend and local state
pub async fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let config = engine.config();
    let session = engine.session().await;
    let theme = engine.theme().await;
    let joined = engine.joined_communities().await;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "authenticated": session.authenticated,
                    "user_id": session.user_id(),
                    "username": session.current_profile.as_ref().and_then(|p| p.username.clone()),
                    "backend_url": config.backend_url,
                    "realtime_url": config.realtime_endpoint(),
                    "data_dir": config.data_dir,
                    "theme": theme,
                    "joined_communities": joined
                })
            );
        }
        OutputFormat::Quiet => {
            println!(
                "{}",
                if session.authenticated {
                    "signed-in"
                } else {
                    "signed-out"
                }
            );
        }
        OutputFormat::Human => {
            println!("NebulaNet Status");
            println!("================");
            println!();
            println!("Session:");
            match session.user_id() {
                Some(id) if session.authenticated => {
                    let name = session
                        .current_profile
                        .as_ref()
                        .map(|p| p.display_name().to_string())
                        .unwrap_or_else(|| id.to_string());
                    println!("  Signed in as: {}", name);
                    println!("  User ID:      {}", id);
                }
                _ => println!("  Not signed in"),
            }
            println!();
            println!("Backend:");
            println!(
                "  REST:     {}",
                config.backend_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  Realtime: {}",
                config.realtime_endpoint().as_deref().unwrap_or("(not set)")
            );
            println!();
            println!("Local:");
            println!("  Location:    {}", config.data_dir.display());
            println!("  Theme:       {:?}", theme);
            println!("  Communities: {} joined", joined.len());
        }
    }

    Ok(())
}
