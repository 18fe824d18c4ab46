#![forbid(unsafe_code)]

//! Configuration handling. Parses a TOML file into a strongly-typed
//! structure; a handful of fields honour environment overrides so a user
//! can relocate the data directory or port without editing the file.

use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Environment variable overriding [`Config::user_dir`].
pub const ENV_USER_DIR: &str = "TETHER_USER_DIR";
/// Environment variable overriding [`Config::listen_port`].
pub const ENV_LISTEN_PORT: &str = "TETHER_PORT";
/// Environment variable overriding [`Config::log_level`].
pub const ENV_LOG_LEVEL: &str = "TETHER_LOG";

/// Primary configuration shared across components.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the per-user state directory (roster, partials, share lists).
    pub user_dir: PathBuf,

    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// UDP + TCP listen port. 0 picks a random high port at startup.
    pub listen_port: u16,

    /// STUN servers used for external-address discovery and NAT
    /// classification. At least two are needed for classification.
    pub stun_servers: Vec<String>,

    /// Base URL of the directory service.
    pub directory_url: String,

    /// Whether to attempt IGD port mapping at startup.
    pub upnp_enabled: bool,

    /// Remove a completed file's creator instead of keeping it for seeding.
    pub auto_remove_completed: bool,

    /// How many consecutive failed disk writes to tolerate before the
    /// transfer is surfaced as failed. `None` retries forever.
    pub disk_write_retry_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_dir: PathBuf::from(".tether"),
            log_level: Some("info".to_string()),
            listen_port: 0,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            directory_url: "https://directory.invalid".to_string(),
            upnp_enabled: true,
            auto_remove_completed: true,
            disk_write_retry_limit: None,
        }
    }
}

impl Config {
    /// Load a configuration file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let mut cfg = toml::from_str::<Config>(&data)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_USER_DIR) {
            if !dir.is_empty() {
                self.user_dir = PathBuf::from(dir);
            }
        }
        if let Ok(port) = std::env::var(ENV_LISTEN_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                self.listen_port = port;
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                self.log_level = Some(level);
            }
        }
    }

    /// Directory where in-progress downloads live before completion.
    pub fn partials_dir(&self) -> PathBuf {
        self.user_dir.join("partials")
    }

    /// Directory completed transfer groups are moved into by default.
    pub fn downloads_dir(&self) -> PathBuf {
        self.user_dir.join("downloads")
    }

    /// Create the user directory tree, failing fatally if impossible.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.user_dir, &self.partials_dir(), &self.downloads_dir()] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::fatal(format!("cannot create {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.upnp_enabled);
        assert!(cfg.auto_remove_completed);
        assert_eq!(cfg.stun_servers.len(), 2);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            listen_port = 7710
            upnp_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen_port, 7710);
        assert!(!cfg.upnp_enabled);
        // untouched fields fall back to defaults
        assert!(cfg.auto_remove_completed);
    }
}
