//! Preflight pipeline — ordered pre-start/pre-persist checks with a mixed
//! hard/soft failure policy.
//!
//! A broken scheduled task must never stop an operator from starting their
//! server, but an invalid configuration should prompt instead of silently
//! launching a broken one. Each step is independently skippable through the
//! profile's toggles.

use std::net::IpAddr;
use std::path::Path;

use crate::profile::ProfileSnapshot;

/// What the preflight run gates: starting a process, or persisting state
/// (save/upgrade flows). Scheduled-task sync is best-effort for Start but
/// hard for Persist, since schedules must stay consistent with what is
/// being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightPurpose {
    Start,
    Persist,
}

/// Side-effectful host integrations the pipeline drives: scheduled-task
/// synchronization and directory-permission propagation. The daemon ships a
/// no-op implementation; a platform layer supplies the real one.
pub trait HostServices: Send + Sync {
    fn sync_scheduled_tasks(&self, snapshot: &ProfileSnapshot) -> anyhow::Result<()>;
    fn propagate_permissions(&self, install_dir: &Path) -> anyhow::Result<()>;
}

/// Default host integration: does nothing, succeeds.
pub struct NullHostServices;

impl HostServices for NullHostServices {
    fn sync_scheduled_tasks(&self, _snapshot: &ProfileSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    fn propagate_permissions(&self, _install_dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub ok: bool,
    /// Validation failed; the caller may re-dispatch with an explicit
    /// override instead of treating this as fatal.
    pub requires_confirmation: bool,
    pub warnings: Vec<String>,
    pub public_ip: Option<IpAddr>,
}

impl PreflightReport {
    fn passed(warnings: Vec<String>, public_ip: Option<IpAddr>) -> Self {
        Self {
            ok: true,
            requires_confirmation: false,
            warnings,
            public_ip,
        }
    }
}

/// Run the ordered preflight steps against a frozen profile snapshot.
///
/// `override_validation` continues past a failed validation step (the user
/// confirmed); without it a failed validation short-circuits the pipeline
/// with `requires_confirmation = true`.
pub async fn run_preflight(
    snapshot: &ProfileSnapshot,
    purpose: PreflightPurpose,
    override_validation: bool,
    host: &dyn HostServices,
    http: &reqwest::Client,
) -> PreflightReport {
    let mut warnings = Vec::new();
    let server = &snapshot.identity.display_name;

    // 1. Public-IP discovery — soft fail, never blocks the operation.
    let mut public_ip = None;
    if snapshot.manage_public_ip {
        match discover_public_ip(http).await {
            Ok(ip) => {
                tracing::info!("Public IP for '{}': {}", server, ip);
                public_ip = Some(ip);
            }
            Err(e) => {
                tracing::warn!("Public IP discovery failed for '{}': {}", server, e);
                warnings.push(format!("public IP discovery failed: {}", e));
            }
        }
    }

    // 2. Profile validation — pauses for confirmation rather than failing hard.
    let strict = purpose == PreflightPurpose::Start;
    let report = snapshot.validate(strict);
    if !report.ok {
        if override_validation {
            tracing::warn!(
                "Validation overridden for '{}': {}",
                server,
                report.messages.join("; ")
            );
            warnings.extend(report.messages);
        } else {
            return PreflightReport {
                ok: false,
                requires_confirmation: true,
                warnings: report.messages,
                public_ip,
            };
        }
    }

    // 3. Scheduled-task synchronization — best effort for Start, hard for
    // Persist flows.
    if snapshot.sync_scheduled_tasks {
        if let Err(e) = host.sync_scheduled_tasks(snapshot) {
            match purpose {
                PreflightPurpose::Start => {
                    tracing::warn!("Scheduled-task sync failed for '{}': {}", server, e);
                    warnings.push(format!("scheduled-task sync failed: {}", e));
                }
                PreflightPurpose::Persist => {
                    tracing::error!("Scheduled-task sync failed for '{}': {}", server, e);
                    warnings.push(format!("scheduled-task sync failed: {}", e));
                    return PreflightReport {
                        ok: false,
                        requires_confirmation: false,
                        warnings,
                        public_ip,
                    };
                }
            }
        }
    }

    // 4. Directory-permission propagation — only when configured, reported
    // but never fatal.
    if snapshot.propagate_permissions {
        if let Err(e) = host.propagate_permissions(&snapshot.identity.install_dir) {
            tracing::warn!("Permission propagation failed for '{}': {}", server, e);
            warnings.push(format!("permission propagation failed: {}", e));
        }
    }

    PreflightReport::passed(warnings, public_ip)
}

async fn discover_public_ip(http: &reqwest::Client) -> anyhow::Result<IpAddr> {
    let text = http
        .get("https://api.ipify.org")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(text.trim().parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ServerProfile;

    struct FailingHost;

    impl HostServices for FailingHost {
        fn sync_scheduled_tasks(&self, _: &ProfileSnapshot) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("task scheduler unavailable"))
        }

        fn propagate_permissions(&self, _: &Path) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("acl update denied"))
        }
    }

    fn snapshot() -> ProfileSnapshot {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.executable_path = Some("/bin/sh".to_string());
        p.snapshot()
    }

    #[tokio::test]
    async fn test_clean_pass() {
        let snap = snapshot();
        let report = run_preflight(
            &snap,
            PreflightPurpose::Start,
            false,
            &NullHostServices,
            &reqwest::Client::new(),
        )
        .await;
        assert!(report.ok);
        assert!(!report.requires_confirmation);
        assert!(report.warnings.is_empty());
        // manage_public_ip is off, so no network call was attempted
        assert!(report.public_ip.is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_requires_confirmation() {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.executable_path = Some("/no/such/binary".to_string());
        let snap = p.snapshot();

        let report = run_preflight(
            &snap,
            PreflightPurpose::Start,
            false,
            &NullHostServices,
            &reqwest::Client::new(),
        )
        .await;
        assert!(!report.ok);
        assert!(report.requires_confirmation);
        assert!(report.warnings.iter().any(|m| m.contains("executable")));
    }

    #[tokio::test]
    async fn test_validation_override_continues() {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.executable_path = Some("/no/such/binary".to_string());
        let snap = p.snapshot();

        let report = run_preflight(
            &snap,
            PreflightPurpose::Start,
            true,
            &NullHostServices,
            &reqwest::Client::new(),
        )
        .await;
        assert!(report.ok);
        assert!(!report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_task_sync_soft_for_start() {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.executable_path = Some("/bin/sh".to_string());
        p.sync_scheduled_tasks = true;
        let snap = p.snapshot();

        let report = run_preflight(
            &snap,
            PreflightPurpose::Start,
            false,
            &FailingHost,
            &reqwest::Client::new(),
        )
        .await;
        assert!(report.ok, "task sync failure must not block Start");
        assert!(report.warnings.iter().any(|m| m.contains("scheduled-task")));
    }

    #[tokio::test]
    async fn test_task_sync_hard_for_persist() {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.sync_scheduled_tasks = true;
        let snap = p.snapshot();

        let report = run_preflight(
            &snap,
            PreflightPurpose::Persist,
            false,
            &FailingHost,
            &reqwest::Client::new(),
        )
        .await;
        assert!(!report.ok, "task sync failure must abort Persist flows");
        assert!(!report.requires_confirmation);
    }

    #[tokio::test]
    async fn test_permission_failure_is_warning_only() {
        let mut p = ServerProfile::new("srv", Path::new("/srv/game"));
        p.executable_path = Some("/bin/sh".to_string());
        p.propagate_permissions = true;
        let snap = p.snapshot();

        let report = run_preflight(
            &snap,
            PreflightPurpose::Start,
            false,
            &FailingHost,
            &reqwest::Client::new(),
        )
        .await;
        assert!(report.ok);
        assert!(report.warnings.iter().any(|m| m.contains("permission")));
    }
}
