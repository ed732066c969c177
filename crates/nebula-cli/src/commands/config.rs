//! Config command handlers

use anyhow::{Context, Result};

use nebula_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "backend_url": config.backend_url,
                    "anon_key_set": config.anon_key.is_some(),
                    "realtime_url": config.realtime_endpoint(),
                    "storage_bucket": config.storage_bucket,
                    "page_sizes": config.page_sizes,
                    "update_retry_delay_ms": config.update_retry_delay_ms,
                    "max_deferred_updates": config.max_deferred_updates,
                    "log_level": config.log_level,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let not_set = || "(not set)".to_string();
            println!("Configuration:");
            println!("  data_dir:       {}", config.data_dir.display());
            println!(
                "  backend_url:    {}",
                config.backend_url.clone().unwrap_or_else(not_set)
            );
            println!(
                "  anon_key:       {}",
                if config.anon_key.is_some() {
                    "(set)".to_string()
                } else {
                    not_set()
                }
            );
            println!(
                "  realtime_url:   {}",
                config.realtime_endpoint().unwrap_or_else(not_set)
            );
            println!("  storage_bucket: {}", config.storage_bucket);
            println!(
                "  page_sizes:     feed={} comments={} notifications={} messages={} communities={} search={}",
                config.page_sizes.feed,
                config.page_sizes.comments,
                config.page_sizes.notifications,
                config.page_sizes.messages,
                config.page_sizes.communities,
                config.page_sizes.search
            );
            println!("  log_level:      {}", config.log_level);
            println!(
                "  log_file:       {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(not_set)
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set_value(key, value)?;
    config.save().context("Failed to save configuration")?;

    // Never echo the key back
    let shown = if key == "anon_key" { "(hidden)" } else { value };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
