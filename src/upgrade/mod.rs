//! Upgrade orchestrator — cancellable, progress-reporting install/update of
//! server binaries and mods, serialized process-wide.
//!
//! Two layers of exclusion apply: the in-process single-flight session guard
//! (one upgrade per daemon, regardless of server) and the cross-process
//! operation lock keyed by install directory. The session guard exists
//! because the operation lock only protects the filesystem resource, not
//! the local coordination state.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::lock::{LockError, LockManager};
use crate::profile::ProfileSnapshot;

/// Why an upgrade did not run at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// Another upgrade session is already in flight in this process.
    AlreadyInProgress,
    /// The install directory is locked by another operation or daemon.
    LockContended { holder_pid: Option<u32> },
}

impl std::fmt::Display for UpgradeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeRejection::AlreadyInProgress => write!(f, "an upgrade is already in progress"),
            UpgradeRejection::LockContended { holder_pid } => match holder_pid {
                Some(pid) => write!(f, "install directory locked by pid {}", pid),
                None => write!(f, "install directory locked by another operation"),
            },
        }
    }
}

/// Terminal result of one upgrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeExit {
    Success,
    Cancelled,
    Rejected(UpgradeRejection),
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct UpgradeFlags {
    pub update_server: bool,
    pub update_mods: bool,
    pub force: bool,
}

impl Default for UpgradeFlags {
    fn default() -> Self {
        Self {
            update_server: true,
            update_mods: true,
            force: false,
        }
    }
}

/// Progress event, emitted from a background execution context.
/// Subscribers marshal to their own thread; this component does not.
#[derive(Debug, Clone)]
pub struct UpgradeProgress {
    pub server_id: String,
    pub percent: u8,
    pub message: String,
    pub detail: Option<String>,
}

/// The in-flight session record backing the single-flight guard.
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    pub server_id: String,
    pub started_at: u64,
    cancel: CancellationToken,
}

/// The external update-distribution collaborator (a steamcmd-style tool).
/// Methods block; the orchestrator runs them on the blocking pool.
pub trait UpdateProvider: Send + Sync {
    fn update_server(
        &self,
        snapshot: &ProfileSnapshot,
        force: bool,
        progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()>;

    fn update_mods(
        &self,
        snapshot: &ProfileSnapshot,
        force: bool,
        progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()>;

    fn validate_install(&self, snapshot: &ProfileSnapshot) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum ProviderStep {
    Server,
    Mods,
}

impl ProviderStep {
    fn name(self) -> &'static str {
        match self {
            ProviderStep::Server => "server download",
            ProviderStep::Mods => "mod sync",
        }
    }
}

pub struct UpgradeOrchestrator {
    session: Mutex<Option<UpgradeSession>>,
    events: broadcast::Sender<UpgradeProgress>,
    locks: Arc<LockManager>,
    provider: Arc<dyn UpdateProvider>,
}

impl UpgradeOrchestrator {
    pub fn new(locks: Arc<LockManager>, provider: Arc<dyn UpdateProvider>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            session: Mutex::new(None),
            events,
            locks,
            provider,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpgradeProgress> {
        self.events.subscribe()
    }

    /// Server id of the upgrade currently in flight, if any.
    pub fn current_session(&self) -> Option<UpgradeSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    /// Request cancellation of the in-flight upgrade. Returns whether a
    /// session existed to cancel. Cancellation is cooperative; the session
    /// stops at the next checkpoint.
    pub fn cancel_current(&self) -> bool {
        match self.session.lock() {
            Ok(session) => match session.as_ref() {
                Some(s) => {
                    tracing::info!("Cancellation requested for upgrade of '{}'", s.server_id);
                    s.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Run one upgrade. Single-flight: a second call while any session is in
    /// flight is rejected immediately, never queued. On every exit path the
    /// operation lock is released, the session guard cleared and a terminal
    /// progress event emitted.
    pub async fn run(
        &self,
        snapshot: &ProfileSnapshot,
        flags: UpgradeFlags,
        cancel: CancellationToken,
    ) -> UpgradeExit {
        let server_id = snapshot.identity.server_id.clone();

        // Single-flight guard.
        {
            let mut session = match self.session.lock() {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Upgrade session guard poisoned: {}", e);
                    return UpgradeExit::Failed("session guard poisoned".to_string());
                }
            };
            if let Some(active) = session.as_ref() {
                tracing::warn!(
                    "Upgrade for '{}' rejected: session for '{}' already in flight",
                    server_id,
                    active.server_id
                );
                return UpgradeExit::Rejected(UpgradeRejection::AlreadyInProgress);
            }
            *session = Some(UpgradeSession {
                server_id: server_id.clone(),
                started_at: current_timestamp(),
                cancel: cancel.clone(),
            });
        }

        let exit = self.run_locked(snapshot, flags, &cancel).await;

        // Guaranteed cleanup: clear the guard and emit exactly one terminal
        // event, whatever the exit was.
        if let Ok(mut session) = self.session.lock() {
            *session = None;
        }
        let (percent, message) = match &exit {
            UpgradeExit::Success => (100, "upgrade complete".to_string()),
            UpgradeExit::Cancelled => (100, "upgrade cancelled".to_string()),
            UpgradeExit::Rejected(r) => (100, format!("upgrade rejected: {}", r)),
            UpgradeExit::Failed(m) => (100, format!("upgrade failed: {}", m)),
        };
        self.emit(&server_id, percent, &message, None);
        tracing::info!("Upgrade for '{}' finished: {:?}", server_id, exit);
        exit
    }

    async fn run_locked(
        &self,
        snapshot: &ProfileSnapshot,
        flags: UpgradeFlags,
        cancel: &CancellationToken,
    ) -> UpgradeExit {
        // Lock before any file I/O. Contention is a rejection, distinct
        // from cancellation and from fatal lock-dir problems.
        let mut guard = match self.locks.try_acquire(&snapshot.identity) {
            Ok(g) => g,
            Err(LockError::Contended { holder_pid }) => {
                return UpgradeExit::Rejected(UpgradeRejection::LockContended { holder_pid });
            }
            Err(e) => return UpgradeExit::Failed(e.to_string()),
        };

        let exit = self.run_steps(snapshot, flags, cancel).await;
        guard.release();
        exit
    }

    async fn run_steps(
        &self,
        snapshot: &ProfileSnapshot,
        flags: UpgradeFlags,
        cancel: &CancellationToken,
    ) -> UpgradeExit {
        let server_id = snapshot.identity.server_id.clone();

        if flags.update_server {
            if cancel.is_cancelled() {
                return UpgradeExit::Cancelled;
            }
            self.emit(&server_id, 5, "downloading server binaries", None);
            if let Err(e) = self
                .provider_step(snapshot, flags.force, ProviderStep::Server)
                .await
            {
                return UpgradeExit::Failed(e);
            }
        }

        if flags.update_mods {
            if cancel.is_cancelled() {
                return UpgradeExit::Cancelled;
            }
            self.emit(&server_id, 60, "synchronizing mods", None);
            if let Err(e) = self
                .provider_step(snapshot, flags.force, ProviderStep::Mods)
                .await
            {
                return UpgradeExit::Failed(e);
            }
        }

        if cancel.is_cancelled() {
            return UpgradeExit::Cancelled;
        }
        self.emit(&server_id, 90, "validating installation", None);
        let provider = self.provider.clone();
        let snap = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || provider.validate_install(&snap)).await;
        match result {
            Ok(Ok(())) => UpgradeExit::Success,
            Ok(Err(e)) => UpgradeExit::Failed(format!("validation: {}", e)),
            Err(e) => UpgradeExit::Failed(format!("validation task panicked: {}", e)),
        }
    }

    /// Run one provider step on the blocking pool, forwarding the step's
    /// own progress callbacks into the broadcast feed.
    async fn provider_step(
        &self,
        snapshot: &ProfileSnapshot,
        force: bool,
        step: ProviderStep,
    ) -> Result<(), String> {
        let provider = self.provider.clone();
        let snap = snapshot.clone();
        let events = self.events.clone();
        let server_id = snapshot.identity.server_id.clone();
        let step_name = step.name();

        let result = tokio::task::spawn_blocking(move || {
            let cb = |percent: u8, detail: &str| {
                let _ = events.send(UpgradeProgress {
                    server_id: server_id.clone(),
                    percent,
                    message: step_name.to_string(),
                    detail: Some(detail.to_string()),
                });
            };
            match step {
                ProviderStep::Server => provider.update_server(&snap, force, &cb),
                ProviderStep::Mods => provider.update_mods(&snap, force, &cb),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{}: {}", step_name, e)),
            Err(e) => Err(format!("{} task panicked: {}", step_name, e)),
        }
    }

    fn emit(&self, server_id: &str, percent: u8, message: &str, detail: Option<String>) {
        let _ = self.events.send(UpgradeProgress {
            server_id: server_id.to_string(),
            percent,
            message: message.to_string(),
            detail,
        });
    }
}

/// Default provider: shells out to the configured external update tool.
/// The contract mirrors steamcmd-style distribution tools: install dir,
/// optional branch, force revalidation.
pub struct CommandUpdateProvider {
    tool: Option<String>,
    base_args: Vec<String>,
}

impl CommandUpdateProvider {
    pub fn new(tool: Option<String>, base_args: Vec<String>) -> Self {
        Self { tool, base_args }
    }

    fn run_tool(
        &self,
        subcommand: &str,
        snapshot: &ProfileSnapshot,
        force: bool,
        progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()> {
        let tool = self
            .tool
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no update tool configured"))?;

        let mut cmd = std::process::Command::new(tool);
        cmd.args(&self.base_args)
            .arg(subcommand)
            .arg("--install-dir")
            .arg(&snapshot.identity.install_dir);
        if let Some(branch) = &snapshot.branch {
            cmd.arg("--branch").arg(branch);
        }
        if force {
            cmd.arg("--force");
        }

        progress(0, &format!("running {} {}", tool, subcommand));
        let output = cmd
            .output()
            .map_err(|e| anyhow::anyhow!("failed to run '{}': {}", tool, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "'{} {}' exited with {}: {}",
                tool,
                subcommand,
                output.status,
                stderr.trim()
            );
        }
        progress(100, &format!("{} finished", subcommand));
        Ok(())
    }
}

impl UpdateProvider for CommandUpdateProvider {
    fn update_server(
        &self,
        snapshot: &ProfileSnapshot,
        force: bool,
        progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()> {
        self.run_tool("update", snapshot, force, progress)
    }

    fn update_mods(
        &self,
        snapshot: &ProfileSnapshot,
        force: bool,
        progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()> {
        self.run_tool("mods", snapshot, force, progress)
    }

    fn validate_install(&self, snapshot: &ProfileSnapshot) -> anyhow::Result<()> {
        self.run_tool("verify", snapshot, false, &|_, _| {})
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
