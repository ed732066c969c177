//! NebulaNet CLI
//!
//! Command-line client for NebulaNet: feed, comments, chat and notifications.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nebula_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "nebula")]
#[command(about = "NebulaNet - social feed and realtime chat from the terminal")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        email: String,
        /// Password (prompted if not provided)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Sign out and clear local session state
    Logout,
    /// Show session and backend status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show the home feed
    Feed {
        /// Number of pages to load
        #[arg(short, long, default_value_t = 1)]
        pages: usize,
    },
    /// Show notifications
    Notifications {
        /// Mark all notifications as read
        #[arg(long)]
        read_all: bool,
    },
    /// Like or unlike a post
    Like {
        /// Post ID
        post_id: String,
    },
    /// Comment on a post (shows the thread when no text is given)
    Comment {
        /// Post ID
        post_id: String,
        /// Comment text
        text: Option<String>,
        /// Reply to this comment
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Publish a post
    Post {
        /// Post text
        text: String,
        /// Attach a media file (repeatable)
        #[arg(short, long)]
        media: Vec<PathBuf>,
        /// Publish into a community
        #[arg(long)]
        community: Option<String>,
    },
    /// Delete one of your posts
    #[command(alias = "rm")]
    Delete {
        /// Post ID
        post_id: String,
    },
    /// Show a conversation or send a message
    Chat {
        /// Peer user ID
        peer: String,
        /// Message to send
        #[arg(short, long)]
        send: Option<String>,
    },
    /// List, join or leave communities
    Communities {
        /// Join this community
        #[arg(long, conflicts_with = "leave")]
        join: Option<String>,
        /// Leave this community
        #[arg(long)]
        leave: Option<String>,
    },
    /// Search users, posts and communities
    Search {
        /// Text to look for
        query: String,
        /// Restrict the search to one kind
        #[arg(short, long, value_enum, default_value_t)]
        scope: commands::people::ScopeArg,
        /// Result page, starting at 1
        #[arg(short, long, default_value_t = 1)]
        page: usize,
    },
    /// Follow a user
    Follow {
        /// User ID
        user_id: String,
        /// Stop following instead
        #[arg(long)]
        unfollow: bool,
    },
    /// Show post, like and follower counts of a user
    Stats {
        /// User ID (defaults to you)
        user_id: Option<String>,
    },
    /// Toggle between light and dark theme
    Theme,
    /// Follow the feed and notifications live until Ctrl-C
    Watch,
    /// Run a scripted scenario against an in-memory backend
    Demo,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (backend_url, anon_key, data_dir, log_level, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config);

    // Commands that don't need a backend
    match cli.command {
        Commands::Config { command } => return handle_config_command(command, &output),
        Commands::Demo => return commands::demo::run(&output).await,
        _ => {}
    }

    let engine = commands::open_engine(config).await?;

    match cli.command {
        Commands::Config { .. } | Commands::Demo => unreachable!(), // Handled above
        Commands::Login { email, password } => {
            commands::auth::login(&engine, &email, password, &output).await
        }
        Commands::Logout => commands::auth::logout(&engine, &output).await,
        Commands::Status => commands::status::show(&engine, &output).await,
        Commands::Feed { pages } => commands::feed::show(&engine, pages, &output).await,
        Commands::Notifications { read_all } => {
            commands::notifications::show(&engine, read_all, &output).await
        }
        Commands::Like { post_id } => commands::post::like(&engine, &post_id, &output).await,
        Commands::Comment {
            post_id,
            text,
            reply_to,
        } => commands::post::comment(&engine, &post_id, text, reply_to, &output).await,
        Commands::Post {
            text,
            media,
            community,
        } => commands::post::create(&engine, &text, media, community, &output).await,
        Commands::Delete { post_id } => commands::post::delete(&engine, &post_id, &output).await,
        Commands::Chat { peer, send } => commands::chat::run(&engine, &peer, send, &output).await,
        Commands::Communities { join, leave } => {
            commands::feed::communities(&engine, join, leave, &output).await
        }
        Commands::Search { query, scope, page } => {
            commands::people::search(&engine, &query, scope, page, &output).await
        }
        Commands::Follow { user_id, unfollow } => {
            commands::people::follow(&engine, &user_id, unfollow, &output).await
        }
        Commands::Stats { user_id } => commands::people::stats(&engine, user_id, &output).await,
        Commands::Theme => {
            let theme = engine.toggle_theme().await;
            output.success(&format!("Theme set to {:?}", theme).to_lowercase());
            Ok(())
        }
        Commands::Watch => commands::watch::run(&engine, &output).await,
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(&key, &value, output),
    }
}

/// Install the tracing subscriber: stderr by default, or the configured log file
fn init_logging(config: &Config) {
    let level = &config.log_level;
    let env_filter = EnvFilter::new(format!("nebula_core={},nebula_cli={}", level, level));

    match config.log_file {
        Some(ref path) => {
            let log_file = match File::create(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not create log file {:?}: {}", path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
