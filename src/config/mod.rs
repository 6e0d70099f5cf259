//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::auth::StoredSession;

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the backend project (e.g. https://abcd.supabase.co)
    pub backend_url: Option<String>,
    /// Publishable anon API key, sent as the `apikey` header on every request
    pub anon_key: Option<String>,
    /// Current signed-in session
    pub session: Option<StoredSession>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "huddle-cli", "huddle-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields defaults seeded from `HUDDLE_URL` /
    /// `HUDDLE_ANON_KEY` so a fresh install can log in without editing
    /// the config by hand.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::from_env());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let mut config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        // Env vars override nothing once set on disk, but fill gaps.
        if config.backend_url.is_none() {
            config.backend_url = std::env::var("HUDDLE_URL").ok();
        }
        if config.anon_key.is_none() {
            config.anon_key = std::env::var("HUDDLE_ANON_KEY").ok();
        }

        Ok(config)
    }

    fn from_env() -> Self {
        Self {
            backend_url: std::env::var("HUDDLE_URL").ok(),
            anon_key: std::env::var("HUDDLE_ANON_KEY").ok(),
            session: None,
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Backend base URL, trailing slash trimmed.
    pub fn backend_url(&self) -> Result<String> {
        self.backend_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .context("No backend URL configured. Set HUDDLE_URL or edit the config file.")
    }

    /// Anon API key.
    pub fn anon_key(&self) -> Result<String> {
        self.anon_key
            .clone()
            .context("No anon key configured. Set HUDDLE_ANON_KEY or edit the config file.")
    }

    pub fn get_session(&self) -> Option<StoredSession> {
        self.session.clone()
    }

    pub fn set_session(&mut self, session: StoredSession) {
        self.session = Some(session);
    }

    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// Current session, or an error telling the user to log in.
    pub fn require_session(&self) -> Result<StoredSession> {
        self.get_session()
            .context("Not signed in. Run 'huddle-cli login' first.")
    }
}
