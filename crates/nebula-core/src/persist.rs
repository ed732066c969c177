//! Persisted session subset
//!
//! Only identity, profile, theme and joined communities survive a restart.
//! Feed and chat collections are always refetched.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{Profile, Theme, User};

/// The state written to `session.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub joined_communities: Vec<String>,
}

/// File-backed holder of `PersistedState`
#[derive(Debug, Default)]
pub struct StateFile {
    state: PersistedState,
    path: Option<PathBuf>,
}

impl StateFile {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state file that persists to disk, loading what is there
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let mut file = Self {
            state: PersistedState::default(),
            path: Some(path.clone()),
        };

        if path.exists() {
            file.load()?;
        }

        Ok(file)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    /// Replace the state and write it out
    pub fn store(&mut self, state: PersistedState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        self.state = state;
        self.save()
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&self.state)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, json).context("Failed to save session state")?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = fs::read_to_string(path).context("Failed to read session state")?;
        self.state = serde_json::from_str(&json).context("Failed to parse session state")?;
        Ok(())
    }
}
