//! Operation dispatcher — maps a user intent plus the current lifecycle
//! status to the legal next action, and supervises the resulting sequence.
//!
//! The `Coordinator` is the explicit application-root registry: it owns the
//! profile store, status tracker, lock manager, upgrade orchestrator and
//! runtime store, and `dispatch` is the single entry point through which
//! every status write is funneled. No raw error crosses this boundary;
//! everything is classified into a `DispatchOutcome`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::run_backup;
use crate::config::GlobalConfig;
use crate::lock::{LockError, LockGuard, LockManager};
use crate::preflight::{run_preflight, HostServices, PreflightPurpose};
use crate::profile::{ProfileSnapshot, ProfileStore, ServerIdentity, ServerProfile};
use crate::runtime::{RuntimeError, RuntimeStore, ServerProcess};
use crate::status::{LifecycleStatus, StatusTracker};
use crate::upgrade::{UpdateProvider, UpgradeExit, UpgradeFlags, UpgradeOrchestrator};

/// What the caller wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    Upgrade,
    Backup,
    Reset,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intent::Start => "start",
            Intent::Stop => "stop",
            Intent::Upgrade => "upgrade",
            Intent::Backup => "backup",
            Intent::Reset => "reset",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// The caller has confirmed a gated operation (stop a running server,
    /// upgrade a running server, reset).
    pub confirmed: bool,
    /// Proceed past failed profile validation (the caller saw the messages
    /// and chose to continue anyway).
    pub override_validation: bool,
    pub upgrade_flags: UpgradeFlags,
}

/// Structured result of one dispatch. The UI layer decides rendering;
/// nothing here is an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed { message: String },
    /// Legal but gated; re-dispatch with `confirmed` (or
    /// `override_validation`) to proceed.
    ConfirmRequired { reason: String },
    /// Illegal in the current state, or blocked by contention. Nothing ran.
    Rejected { reason: String },
    Cancelled,
    Failed { message: String, recoverable: bool },
}

impl DispatchOutcome {
    fn completed(message: impl Into<String>) -> Self {
        DispatchOutcome::Completed { message: message.into() }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        DispatchOutcome::Rejected { reason: reason.into() }
    }

    fn confirm(reason: impl Into<String>) -> Self {
        DispatchOutcome::ConfirmRequired { reason: reason.into() }
    }

    fn failed(message: impl Into<String>, recoverable: bool) -> Self {
        DispatchOutcome::Failed { message: message.into(), recoverable }
    }
}

/// Summary row for list surfaces (IPC, relay).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerOverview {
    pub id: String,
    pub name: String,
    pub alias: Option<String>,
    pub status: LifecycleStatus,
    pub pid: Option<u32>,
}

pub struct Coordinator {
    profiles: Mutex<ProfileStore>,
    pub status: StatusTracker,
    pub upgrades: UpgradeOrchestrator,
    locks: Arc<LockManager>,
    runtime: RuntimeStore,
    host: Arc<dyn HostServices>,
    http: reqwest::Client,
    config: GlobalConfig,
}

impl Coordinator {
    pub fn new(
        config: GlobalConfig,
        host: Arc<dyn HostServices>,
        provider: Arc<dyn UpdateProvider>,
    ) -> Self {
        let locks = Arc::new(LockManager::new(&config.effective_lock_dir()));
        Self {
            profiles: Mutex::new(ProfileStore::new(&config.profiles_path)),
            status: StatusTracker::new(),
            upgrades: UpgradeOrchestrator::new(locks.clone(), provider),
            locks,
            runtime: RuntimeStore::new(),
            host,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Load profiles from disk and seed the status tracker.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let mut profiles = self.profiles_lock()?;
        profiles.load()?;
        for profile in profiles.list() {
            let initial = if profile.installed {
                LifecycleStatus::Stopped
            } else {
                LifecycleStatus::Uninstalled
            };
            self.status.register(&profile.id, initial);
        }
        tracing::info!("Coordinator managing {} profiles", profiles.list().len());
        Ok(())
    }

    fn profiles_lock(&self) -> anyhow::Result<MutexGuard<'_, ProfileStore>> {
        self.profiles
            .lock()
            .map_err(|e| anyhow::anyhow!("profile store lock poisoned: {}", e))
    }

    // ── Profile registry surface ─────────────────────────────

    pub fn list_profiles(&self) -> Vec<ServerProfile> {
        self.profiles_lock()
            .map(|p| p.list().to_vec())
            .unwrap_or_default()
    }

    pub fn add_profile(&self, profile: ServerProfile) -> anyhow::Result<String> {
        let id = profile.id.clone();
        let initial = if profile.installed {
            LifecycleStatus::Stopped
        } else {
            LifecycleStatus::Uninstalled
        };
        self.profiles_lock()?.add(profile)?;
        self.status.register(&id, initial);
        Ok(id)
    }

    pub fn remove_profile(&self, id: &str) -> anyhow::Result<()> {
        self.profiles_lock()?.remove(id)?;
        self.status.remove(id);
        Ok(())
    }

    pub fn update_profile(&self, id: &str, profile: ServerProfile) -> anyhow::Result<()> {
        self.profiles_lock()?.update(id, profile)
    }

    /// Resolve a profile by id, name or alias into a frozen snapshot.
    pub fn resolve_snapshot(&self, key: &str) -> Option<ProfileSnapshot> {
        self.profiles_lock()
            .ok()
            .and_then(|p| p.resolve(key).map(|profile| profile.snapshot()))
    }

    pub async fn overview(&self) -> Vec<ServerOverview> {
        let profiles = self.list_profiles();
        let mut rows = Vec::with_capacity(profiles.len());
        for p in profiles {
            let pid = self.runtime.get(&p.id).await.filter(|r| r.is_running()).map(|r| r.pid);
            rows.push(ServerOverview {
                status: self.status.get(&p.id),
                id: p.id,
                name: p.name,
                alias: p.alias,
                pid,
            });
        }
        rows
    }

    // ── Dispatch ─────────────────────────────────────────────

    /// Single entry point for every operation. `key` may be a profile id,
    /// name, or relay alias.
    pub async fn dispatch(
        &self,
        key: &str,
        intent: Intent,
        opts: DispatchOptions,
    ) -> DispatchOutcome {
        let snapshot = match self.resolve_snapshot(key) {
            Some(s) => s,
            None => return DispatchOutcome::rejected(format!("unknown server '{}'", key)),
        };
        let server_id = snapshot.identity.server_id.clone();
        let status = self.status.get(&server_id);
        tracing::info!(
            "Dispatch: server='{}' intent={} status={}",
            snapshot.identity.display_name,
            intent,
            status
        );

        match intent {
            Intent::Start => self.dispatch_start(snapshot, status, &opts).await,
            Intent::Stop => self.dispatch_stop(snapshot, status, &opts).await,
            Intent::Upgrade => self.dispatch_upgrade(snapshot, status, &opts).await,
            Intent::Backup => self.dispatch_backup(snapshot, status).await,
            Intent::Reset => self.dispatch_reset(snapshot, status, &opts).await,
        }
    }

    async fn dispatch_start(
        &self,
        snapshot: ProfileSnapshot,
        status: LifecycleStatus,
        opts: &DispatchOptions,
    ) -> DispatchOutcome {
        match status {
            LifecycleStatus::Running => DispatchOutcome::rejected("server is already running"),
            LifecycleStatus::Initializing => DispatchOutcome::rejected(
                "server is still initializing; force-stop it before starting again",
            ),
            LifecycleStatus::Stopping => {
                DispatchOutcome::rejected("server is stopping; wait for it to finish")
            }
            LifecycleStatus::Updating => {
                DispatchOutcome::rejected("an upgrade is in progress for this server")
            }
            LifecycleStatus::Stopped | LifecycleStatus::Uninstalled => {
                self.do_start(&snapshot, opts).await
            }
        }
    }

    /// Take the install-dir operation lock or turn the contention into a
    /// `Rejected` outcome the caller can return as-is.
    fn try_operation_lock(
        &self,
        identity: &ServerIdentity,
        verb: &str,
    ) -> Result<LockGuard, DispatchOutcome> {
        match self.locks.try_acquire(identity) {
            Ok(g) => Ok(g),
            Err(LockError::Contended { holder_pid }) => {
                let holder = holder_pid
                    .map(|p| format!(" (pid {})", p))
                    .unwrap_or_default();
                Err(DispatchOutcome::rejected(format!(
                    "could not {}: this install directory is already managed elsewhere{}",
                    verb, holder
                )))
            }
            Err(e) => Err(DispatchOutcome::failed(e.to_string(), false)),
        }
    }

    async fn do_start(&self, snapshot: &ProfileSnapshot, opts: &DispatchOptions) -> DispatchOutcome {
        // Lock first: another process or operation owning this install dir
        // means we must not even preflight.
        let mut guard = match self.try_operation_lock(&snapshot.identity, "start") {
            Ok(g) => g,
            Err(outcome) => return outcome,
        };
        let outcome = self.start_under_lock(snapshot, opts).await;
        guard.release();
        outcome
    }

    /// Preflight, transition and launch. The caller must hold the
    /// operation lock for `snapshot.identity`.
    async fn start_under_lock(
        &self,
        snapshot: &ProfileSnapshot,
        opts: &DispatchOptions,
    ) -> DispatchOutcome {
        let server_id = snapshot.identity.server_id.clone();

        let report = run_preflight(
            snapshot,
            PreflightPurpose::Start,
            opts.override_validation,
            self.host.as_ref(),
            &self.http,
        )
        .await;
        if report.requires_confirmation {
            return DispatchOutcome::confirm(format!(
                "profile validation failed: {}",
                report.warnings.join("; ")
            ));
        }
        if !report.ok {
            return DispatchOutcome::failed(report.warnings.join("; "), true);
        }

        if let Err(e) = self.status.set(&server_id, LifecycleStatus::Initializing) {
            return DispatchOutcome::failed(e.to_string(), true);
        }

        self.launch_and_wait(snapshot).await
    }

    async fn launch_and_wait(&self, snapshot: &ProfileSnapshot) -> DispatchOutcome {
        let server_id = snapshot.identity.server_id.clone();

        let process = match ServerProcess::launch(snapshot) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                // Missing executable is a configuration problem the user
                // must fix; a failed spawn is worth retrying.
                let recoverable = !matches!(e, RuntimeError::MissingExecutable);
                return DispatchOutcome::failed(e.to_string(), recoverable);
            }
        };

        let process = self.runtime.insert(&server_id, process).await;
        let timeout = Duration::from_secs(self.config.ready_timeout_secs);
        if let Err(e) = process.wait_ready(timeout).await {
            let _ = process.force_kill();
            process.wait_exit(Duration::from_secs(5)).await;
            self.runtime.remove(&server_id).await;
            let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
            return DispatchOutcome::failed(e.to_string(), true);
        }

        match self.status.set(&server_id, LifecycleStatus::Running) {
            Ok(()) => DispatchOutcome::completed(format!(
                "'{}' is running (pid {})",
                snapshot.identity.display_name, process.pid
            )),
            Err(e) => DispatchOutcome::failed(e.to_string(), true),
        }
    }

    async fn dispatch_stop(
        &self,
        snapshot: ProfileSnapshot,
        status: LifecycleStatus,
        opts: &DispatchOptions,
    ) -> DispatchOutcome {
        match status {
            // Idempotent no-op: no lock, no status write.
            LifecycleStatus::Stopped | LifecycleStatus::Uninstalled => {
                DispatchOutcome::completed(format!(
                    "'{}' is not running",
                    snapshot.identity.display_name
                ))
            }
            LifecycleStatus::Updating => {
                DispatchOutcome::rejected("an upgrade is in progress; cancel it instead")
            }
            LifecycleStatus::Stopping => DispatchOutcome::rejected("server is already stopping"),
            LifecycleStatus::Initializing => {
                if !opts.confirmed {
                    return DispatchOutcome::confirm(format!(
                        "'{}' is still initializing; force-stop it?",
                        snapshot.identity.display_name
                    ));
                }
                self.do_stop(&snapshot, true).await
            }
            LifecycleStatus::Running => {
                if !opts.confirmed {
                    return DispatchOutcome::confirm(format!(
                        "shut down '{}'?",
                        snapshot.identity.display_name
                    ));
                }
                self.do_stop(&snapshot, false).await
            }
        }
    }

    /// The shutdown sequence: Stopping, graceful command (unless forcing),
    /// force-kill fallback, Stopped. Also used by the upgrade and reset
    /// paths.
    async fn do_stop(&self, snapshot: &ProfileSnapshot, force: bool) -> DispatchOutcome {
        let server_id = snapshot.identity.server_id.clone();
        if let Err(e) = self.status.set(&server_id, LifecycleStatus::Stopping) {
            return DispatchOutcome::failed(e.to_string(), true);
        }

        let process = match self.runtime.get(&server_id).await {
            Some(p) if p.is_running() => p,
            _ => {
                // Nothing to stop; the tracked process is already gone.
                self.runtime.remove(&server_id).await;
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                return DispatchOutcome::completed(format!(
                    "'{}' stopped",
                    snapshot.identity.display_name
                ));
            }
        };

        let stop_timeout = Duration::from_secs(self.config.stop_timeout_secs);
        let mut exited = false;
        if !force {
            if let Some(cmd) = &snapshot.stop_command {
                match process.send_command(cmd).await {
                    Ok(()) => exited = process.wait_exit(stop_timeout).await,
                    Err(e) => {
                        tracing::warn!("Failed to send stop command to '{}': {}", server_id, e)
                    }
                }
            }
        }

        if !exited && process.is_running() {
            if let Err(e) = process.force_kill() {
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                self.runtime.remove(&server_id).await;
                return DispatchOutcome::failed(e.to_string(), true);
            }
            process.wait_exit(Duration::from_secs(10)).await;
        }

        self.runtime.remove(&server_id).await;
        match self.status.set(&server_id, LifecycleStatus::Stopped) {
            Ok(()) => DispatchOutcome::completed(format!(
                "'{}' stopped",
                snapshot.identity.display_name
            )),
            Err(e) => DispatchOutcome::failed(e.to_string(), true),
        }
    }

    async fn dispatch_upgrade(
        &self,
        snapshot: ProfileSnapshot,
        status: LifecycleStatus,
        opts: &DispatchOptions,
    ) -> DispatchOutcome {
        match status {
            LifecycleStatus::Updating => {
                DispatchOutcome::rejected("an upgrade is already in progress")
            }
            LifecycleStatus::Initializing | LifecycleStatus::Stopping => {
                DispatchOutcome::rejected("server is in a transient state; stop it first")
            }
            LifecycleStatus::Running => {
                if !opts.confirmed {
                    return DispatchOutcome::confirm(format!(
                        "'{}' is running; upgrading will shut it down first",
                        snapshot.identity.display_name
                    ));
                }
                // One supervised sequence: graceful stop, then upgrade.
                // If the stop leg fails the upgrade is not attempted.
                match self.do_stop(&snapshot, false).await {
                    DispatchOutcome::Completed { .. } => self.do_upgrade(&snapshot, opts).await,
                    other => other,
                }
            }
            LifecycleStatus::Stopped | LifecycleStatus::Uninstalled => {
                self.do_upgrade(&snapshot, opts).await
            }
        }
    }

    async fn do_upgrade(&self, snapshot: &ProfileSnapshot, opts: &DispatchOptions) -> DispatchOutcome {
        let server_id = snapshot.identity.server_id.clone();

        let report = run_preflight(
            snapshot,
            PreflightPurpose::Persist,
            opts.override_validation,
            self.host.as_ref(),
            &self.http,
        )
        .await;
        if report.requires_confirmation {
            return DispatchOutcome::confirm(format!(
                "profile validation failed: {}",
                report.warnings.join("; ")
            ));
        }
        if !report.ok {
            return DispatchOutcome::failed(report.warnings.join("; "), true);
        }

        // Claim Updating atomically: a concurrent dispatch that lost the
        // race must not mistake a same-status no-op for its own transition.
        let prior = match self.status.claim(&server_id, LifecycleStatus::Updating) {
            Ok(prior) => prior,
            Err(_) => return DispatchOutcome::rejected("an upgrade is already in progress"),
        };

        let exit = self
            .upgrades
            .run(snapshot, opts.upgrade_flags, CancellationToken::new())
            .await;

        match exit {
            UpgradeExit::Success => {
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                if let Ok(mut profiles) = self.profiles_lock() {
                    if let Err(e) = profiles.mark_installed(&server_id) {
                        tracing::warn!("Failed to mark '{}' installed: {}", server_id, e);
                    }
                }
                DispatchOutcome::completed(format!(
                    "'{}' updated successfully",
                    snapshot.identity.display_name
                ))
            }
            UpgradeExit::Cancelled => {
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                DispatchOutcome::Cancelled
            }
            // The orchestrator refused to even start (foreign lock holder,
            // session busy): nothing ran, so the status we claimed from is
            // still the truth.
            UpgradeExit::Rejected(reason) => {
                self.status.rollback(&server_id, prior);
                DispatchOutcome::rejected(reason.to_string())
            }
            UpgradeExit::Failed(message) => {
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
                DispatchOutcome::failed(message, true)
            }
        }
    }

    async fn dispatch_backup(
        &self,
        snapshot: ProfileSnapshot,
        status: LifecycleStatus,
    ) -> DispatchOutcome {
        match status {
            // Never back up while an upgrade is rewriting the install.
            LifecycleStatus::Updating => {
                DispatchOutcome::rejected("backup is blocked while an upgrade is in progress")
            }
            LifecycleStatus::Initializing | LifecycleStatus::Stopping => {
                DispatchOutcome::rejected("server is in a transient state; try again shortly")
            }
            // Running is fine: backup is read-mostly and tolerates
            // best-effort staleness.
            LifecycleStatus::Running
            | LifecycleStatus::Stopped
            | LifecycleStatus::Uninstalled => {
                match run_backup(&snapshot, &self.config.backups_dir).await {
                    Ok(path) => DispatchOutcome::completed(format!(
                        "backup written to {}",
                        path.display()
                    )),
                    Err(e) => DispatchOutcome::failed(e.to_string(), true),
                }
            }
        }
    }

    async fn dispatch_reset(
        &self,
        snapshot: ProfileSnapshot,
        status: LifecycleStatus,
        opts: &DispatchOptions,
    ) -> DispatchOutcome {
        match status {
            LifecycleStatus::Running | LifecycleStatus::Initializing => {
                if !opts.confirmed {
                    return DispatchOutcome::confirm(format!(
                        "force-stop and restart '{}'?",
                        snapshot.identity.display_name
                    ));
                }
                // One lock spans the whole sequence: nothing may slip in
                // between the force-stop and the relaunch.
                let mut guard = match self.try_operation_lock(&snapshot.identity, "reset") {
                    Ok(g) => g,
                    Err(outcome) => return outcome,
                };
                let outcome = match self.do_stop(&snapshot, true).await {
                    DispatchOutcome::Completed { .. } => {
                        self.start_under_lock(&snapshot, opts).await
                    }
                    other => other,
                };
                guard.release();
                outcome
            }
            _ => DispatchOutcome::rejected("reset only applies to a running server"),
        }
    }

    // ── Background observation ───────────────────────────────

    /// Funnel observed process exits through the status tracker. Called
    /// periodically by the daemon's monitor loop.
    pub async fn observe_exits(&self) {
        for server_id in self.runtime.dead_server_ids().await {
            let status = self.status.get(&server_id);
            if matches!(
                status,
                LifecycleStatus::Running | LifecycleStatus::Initializing
            ) {
                tracing::warn!(
                    "Server '{}' process exited unexpectedly (was {})",
                    server_id,
                    status
                );
                let _ = self.status.set(&server_id, LifecycleStatus::Stopped);
            }
            self.runtime.remove(&server_id).await;
        }
    }

    /// Request cancellation of the in-flight upgrade, if any.
    pub fn cancel_upgrade(&self) -> bool {
        self.upgrades.cancel_current()
    }
}
