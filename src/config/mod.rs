use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Global daemon configuration, loaded from `config/warden.toml`.
/// A missing or unreadable file falls back to defaults so a bare checkout
/// still starts.
#[derive(Deserialize, Debug, Clone)]
pub struct GlobalConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_profiles_path")]
    pub profiles_path: String,
    /// Directory for cross-process operation lock files. Defaults to the
    /// system temp dir so separate daemon instances agree on it.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,
    /// External update tool invoked by the default update provider
    /// (steamcmd or equivalent). None disables real upgrades.
    #[serde(default)]
    pub update_tool: Option<String>,
    #[serde(default)]
    pub update_tool_args: Vec<String>,
    /// Seconds to wait for a launched server to report ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Seconds to wait for a graceful stop before force-killing.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:57575".to_string()
}

fn default_profiles_path() -> String {
    "./profiles.json".to_string()
}

fn default_backups_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_ready_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            profiles_path: default_profiles_path(),
            lock_dir: None,
            backups_dir: default_backups_dir(),
            update_tool: None,
            update_tool_args: Vec::new(),
            ready_timeout_secs: default_ready_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl GlobalConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("config/warden.toml"))
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            // A missing file is the normal first-run case.
            Err(_) => return Ok(Self::default()),
        };
        match toml::from_str(&s) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                tracing::warn!(
                    "Malformed config {}: {}; falling back to defaults",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Effective lock directory: configured path or the system temp dir.
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.listen_addr, "127.0.0.1:57575");
        assert!(cfg.update_tool.is_none());
        assert_eq!(cfg.ready_timeout_secs, 120);
    }

    #[test]
    fn test_partial_toml() {
        let cfg: GlobalConfig =
            toml::from_str("listen_addr = \"0.0.0.0:9000\"\nupdate_tool = \"steamcmd\"").unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.update_tool.as_deref(), Some("steamcmd"));
        // unspecified fields fall back to defaults
        assert_eq!(cfg.profiles_path, "./profiles.json");
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "listen_addr = 42\n[[[").unwrap();
        let cfg = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:57575");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GlobalConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.profiles_path, "./profiles.json");
    }

    #[test]
    fn test_effective_lock_dir_fallback() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.effective_lock_dir(), std::env::temp_dir());
    }
}
