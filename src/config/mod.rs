//! Engine configuration: YAML loading, validation, and hot reload plumbing.
//!
//! Configuration resolves from, in order:
//! 1. An explicit `--config` path
//! 2. `DISPATCHQ_CONFIG` environment variable
//! 3. `./dispatchq.yaml` in the working directory
//! 4. `~/.config/dispatchq/config.yaml`
//!
//! Absent all four, built-in defaults apply. The scheduler re-reads the
//! active file on change events from [`watcher`]; a file that fails
//! validation leaves the running configuration untouched.

mod types;
pub mod watcher;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Locate the active config file, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var("DISPATCHQ_CONFIG")
        && !env_path.is_empty()
    {
        return Some(PathBuf::from(env_path));
    }
    let cwd = PathBuf::from("dispatchq.yaml");
    if cwd.exists() {
        return Some(cwd);
    }
    if let Some(dir) = dirs::config_dir() {
        let user = dir.join("dispatchq").join("config.yaml");
        if user.exists() {
            return Some(user);
        }
    }
    None
}

/// Load and validate configuration from `path`, or defaults when `None`.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: EngineConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        None => {
            info!("No config file found, using built-in defaults");
            EngineConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

/// Database location: CLI override, then configured path, then the
/// per-user data directory.
pub fn resolve_database_path(config: &EngineConfig, override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    if let Some(ref path) = config.storage.database_path {
        return path.clone();
    }
    dirs::data_dir()
        .map(|d| d.join("dispatchq").join("queue.db"))
        .unwrap_or_else(|| PathBuf::from("dispatchq.db"))
}

#[cfg(test)]
mod mod_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_reads_and_validates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dispatchq.yaml");
        let mut file = std::fs::File::create(&path).expect("create config");
        writeln!(file, "queue:\n  max_concurrent: 2").expect("write config");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.queue.max_concurrent, 2);
    }

    #[test]
    fn load_config_rejects_invalid_weights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dispatchq.yaml");
        let mut file = std::fs::File::create(&path).expect("create config");
        writeln!(file, "scheduling:\n  weight_priority: 0.9").expect("write config");

        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn database_path_override_wins() {
        let mut config = EngineConfig::default();
        config.storage.database_path = Some(PathBuf::from("/tmp/from-config.db"));

        let explicit = PathBuf::from("/tmp/explicit.db");
        assert_eq!(
            resolve_database_path(&config, Some(&explicit)),
            PathBuf::from("/tmp/explicit.db")
        );
        assert_eq!(
            resolve_database_path(&config, None),
            PathBuf::from("/tmp/from-config.db")
        );
    }
}
