//! Server profiles — the persisted settings for each manageable server
//! instance, plus the immutable views handed to long-running operations.
//!
//! A `ServerProfile` is what the operator edits; a `ProfileSnapshot` is the
//! frozen copy an operation works from, so concurrent edits to the live
//! profile cannot corrupt an operation already in flight.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A server instance registered with the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    /// Installation directory. Primary key for cross-process locking.
    pub install_dir: PathBuf,
    pub executable_path: Option<String>,
    #[serde(default)]
    pub launch_args: Vec<String>,
    pub working_dir: Option<String>,
    /// Short alias for the chat relay (e.g. "main").
    #[serde(default)]
    pub alias: Option<String>,
    pub save_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub query_port: Option<u16>,
    pub rcon_port: Option<u16>,
    pub rcon_password: Option<String>,
    /// Update branch/version passed to the update tool.
    #[serde(default)]
    pub branch: Option<String>,
    /// Regex matched against stdout to detect server readiness.
    /// None means ready as soon as the process spawns.
    #[serde(default)]
    pub ready_pattern: Option<String>,
    /// Command written to stdin for a graceful stop. None means force-kill.
    #[serde(default)]
    pub stop_command: Option<String>,
    // Preflight toggles
    #[serde(default)]
    pub manage_public_ip: bool,
    #[serde(default)]
    pub sync_scheduled_tasks: bool,
    #[serde(default)]
    pub propagate_permissions: bool,
    /// Whether server binaries have ever been installed.
    #[serde(default)]
    pub installed: bool,
}

impl ServerProfile {
    pub fn new(name: &str, install_dir: &Path) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            install_dir: install_dir.to_path_buf(),
            executable_path: None,
            launch_args: Vec::new(),
            working_dir: None,
            alias: None,
            save_dir: None,
            port: None,
            query_port: None,
            rcon_port: None,
            rcon_password: None,
            branch: None,
            ready_pattern: None,
            stop_command: None,
            manage_public_ip: false,
            sync_scheduled_tasks: false,
            propagate_permissions: false,
            installed: false,
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            server_id: self.id.clone(),
            display_name: self.name.clone(),
            install_dir: self.install_dir.clone(),
        }
    }

    /// Freeze the mutable settings for the duration of one operation.
    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            identity: self.identity(),
            executable_path: self.executable_path.clone(),
            launch_args: self.launch_args.clone(),
            working_dir: self
                .working_dir
                .clone()
                .unwrap_or_else(|| self.install_dir.to_string_lossy().to_string()),
            save_dir: self.save_dir.clone(),
            port: self.port,
            query_port: self.query_port,
            rcon_port: self.rcon_port,
            rcon_password: self.rcon_password.clone(),
            branch: self.branch.clone(),
            ready_pattern: self.ready_pattern.clone(),
            stop_command: self.stop_command.clone(),
            manage_public_ip: self.manage_public_ip,
            sync_scheduled_tasks: self.sync_scheduled_tasks,
            propagate_permissions: self.propagate_permissions,
        }
    }

    /// Validate the live profile. `strict` additionally requires the
    /// executable to exist on disk (needed before launch, not before an
    /// upgrade that will install it).
    pub fn validate(&self, strict: bool) -> ValidationReport {
        self.snapshot().validate(strict)
    }
}

/// Stable key identifying one manageable server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub server_id: String,
    pub display_name: String,
    pub install_dir: PathBuf,
}

/// Immutable point-in-time copy of profile settings, taken when an
/// operation is dispatched and discarded when it ends.
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    pub identity: ServerIdentity,
    pub executable_path: Option<String>,
    pub launch_args: Vec<String>,
    pub working_dir: String,
    pub save_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub query_port: Option<u16>,
    pub rcon_port: Option<u16>,
    pub rcon_password: Option<String>,
    pub branch: Option<String>,
    pub ready_pattern: Option<String>,
    pub stop_command: Option<String>,
    pub manage_public_ip: bool,
    pub sync_scheduled_tasks: bool,
    pub propagate_permissions: bool,
}

impl ProfileSnapshot {
    /// Validate the frozen settings an operation is about to run with.
    pub fn validate(&self, strict: bool) -> ValidationReport {
        let mut messages = Vec::new();

        if self.identity.display_name.trim().is_empty() {
            messages.push("profile name must not be empty".to_string());
        }
        if self.identity.install_dir.as_os_str().is_empty() {
            messages.push("installation directory is not set".to_string());
        }
        if let (Some(port), Some(rcon)) = (self.port, self.rcon_port) {
            if port == rcon {
                messages.push(format!("server port and rcon port both set to {}", port));
            }
        }
        if let (Some(port), Some(query)) = (self.port, self.query_port) {
            if port == query {
                messages.push(format!("server port and query port both set to {}", port));
            }
        }
        if strict {
            match &self.executable_path {
                None => messages.push("server executable is not configured".to_string()),
                Some(exe) => {
                    if !Path::new(exe).exists() {
                        messages.push(format!("server executable not found: {}", exe));
                    }
                }
            }
        }

        ValidationReport {
            ok: messages.is_empty(),
            messages,
        }
    }
}

/// Human-readable validation result.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

/// Profile persistence — profiles.json management.
pub struct ProfileStore {
    file_path: PathBuf,
    profiles: Vec<ServerProfile>,
}

impl ProfileStore {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: PathBuf::from(file_path),
            profiles: Vec::new(),
        }
    }

    pub fn load(&mut self) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!("Profile store file does not exist, starting empty");
            self.profiles = Vec::new();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        self.profiles = serde_json::from_str(&content)?;
        tracing::info!("Loaded {} profiles", self.profiles.len());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.profiles)?;
        fs::write(&self.file_path, content)?;
        tracing::info!("Saved {} profiles", self.profiles.len());
        Ok(())
    }

    pub fn add(&mut self, profile: ServerProfile) -> Result<()> {
        self.profiles.push(profile);
        self.save()?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        self.profiles.retain(|p| p.id != id);
        self.save()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ServerProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Resolve by id, alias, or name — the relay addresses servers by alias.
    pub fn resolve(&self, key: &str) -> Option<&ServerProfile> {
        self.profiles.iter().find(|p| {
            p.id == key || p.name == key || p.alias.as_deref() == Some(key)
        })
    }

    pub fn list(&self) -> &[ServerProfile] {
        &self.profiles
    }

    pub fn update(&mut self, id: &str, profile: ServerProfile) -> Result<()> {
        if let Some(pos) = self.profiles.iter().position(|p| p.id == id) {
            self.profiles[pos] = profile;
            self.save()?;
            Ok(())
        } else {
            Err(anyhow::anyhow!("Profile not found: {}", id))
        }
    }

    /// Flip the installed flag after the first successful install/update.
    pub fn mark_installed(&mut self, id: &str) -> Result<()> {
        if let Some(pos) = self.profiles.iter().position(|p| p.id == id) {
            if !self.profiles[pos].installed {
                self.profiles[pos].installed = true;
                self.save()?;
            }
            Ok(())
        } else {
            Err(anyhow::anyhow!("Profile not found: {}", id))
        }
    }
}
