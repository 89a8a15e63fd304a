//! Process runtime — spawning, readiness detection, graceful stop and
//! force-kill for managed server processes.
//!
//! Readiness is detected by matching an optional profile-supplied regex
//! against stdout (game servers announce readiness with a log line); a
//! profile without a pattern is considered ready as soon as it spawns.
//! Process exit is observed through a watch channel fed by a waiter task,
//! which is how `Running -> Stopped` crash transitions reach the tracker.

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch, Mutex};

use crate::profile::ProfileSnapshot;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("server executable is not configured")]
    MissingExecutable,
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server did not report ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("server process exited before reporting ready")]
    ExitedBeforeReady,
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
    #[error("stdin channel closed")]
    StdinClosed,
}

/// A server process owned by the coordinator.
#[derive(Debug)]
pub struct ServerProcess {
    pub pid: u32,
    stdin_tx: mpsc::Sender<String>,
    running_rx: watch::Receiver<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl ServerProcess {
    /// Spawn the server described by a frozen profile snapshot.
    pub fn launch(snapshot: &ProfileSnapshot) -> Result<Self, RuntimeError> {
        let program = snapshot
            .executable_path
            .as_deref()
            .ok_or(RuntimeError::MissingExecutable)?;

        let mut cmd = TokioCommand::new(program);
        cmd.args(&snapshot.launch_args)
            .current_dir(&snapshot.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| RuntimeError::SpawnFailed {
            program: program.to_string(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| RuntimeError::SpawnFailed {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no pid for spawned process"),
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let (running_tx, running_rx) = watch::channel(true);
        // Without a pattern the server counts as ready at spawn.
        let (ready_tx, ready_rx) = watch::channel(snapshot.ready_pattern.is_none());

        let ready_regex = snapshot.ready_pattern.as_deref().and_then(|pat| {
            match Regex::new(pat) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Invalid ready_pattern '{}': {}, treating as ready on spawn", pat, e);
                    let _ = ready_tx.send(true);
                    None
                }
            }
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let server = snapshot.identity.display_name.clone();

        // stdout reader: scan for the ready line, keep draining afterwards
        // so the child never blocks on a full pipe.
        if let Some(stdout) = stdout {
            let server = server.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!("[{}] {}", server, line);
                    if let Some(re) = &ready_regex {
                        if !*ready_tx.borrow() && re.is_match(&line) {
                            tracing::info!("Server '{}' reported ready", server);
                            let _ = ready_tx.send(true);
                        }
                    }
                }
            });
        }

        // stderr drain.
        if let Some(stderr) = stderr {
            let server = server.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] stderr: {}", server, line);
                }
            });
        }

        // stdin writer.
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') { cmd } else { format!("{}\n", cmd) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // Process waiter: flips the running flag when the child exits.
        {
            let server = server.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::info!("Server '{}' exited with {}", server, status),
                    Err(e) => tracing::error!("Failed to wait for server '{}': {}", server, e),
                }
                let _ = running_tx.send(false);
            });
        }

        tracing::info!("Server '{}' spawned with PID {}", server, pid);
        Ok(Self {
            pid,
            stdin_tx,
            running_rx,
            ready_rx,
        })
    }

    /// Wait for the server to report ready, failing if it exits first or
    /// the timeout elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let mut ready = self.ready_rx.clone();
        let mut running = self.running_rx.clone();

        let wait = async {
            loop {
                if *ready.borrow() {
                    return Ok(());
                }
                if !*running.borrow() {
                    return Err(RuntimeError::ExitedBeforeReady);
                }
                tokio::select! {
                    r = ready.changed() => {
                        if r.is_err() {
                            return Err(RuntimeError::ExitedBeforeReady);
                        }
                    }
                    r = running.changed() => {
                        if r.is_err() || !*running.borrow() {
                            return Err(RuntimeError::ExitedBeforeReady);
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ReadyTimeout(timeout)),
        }
    }

    /// Send a command string to the process's stdin.
    pub async fn send_command(&self, command: &str) -> Result<(), RuntimeError> {
        self.stdin_tx
            .send(command.to_string())
            .await
            .map_err(|_| RuntimeError::StdinClosed)
    }

    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Wait until the process exits, up to `timeout`. Returns whether it
    /// actually exited.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut running = self.running_rx.clone();
        let wait = async {
            while *running.borrow() {
                if running.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Force-kill by PID. Used when no graceful stop command is configured
    /// or when the graceful window elapses.
    pub fn force_kill(&self) -> Result<(), RuntimeError> {
        force_kill_pid(self.pid)
    }
}

/// Cross-platform hard kill.
pub fn force_kill_pid(pid: u32) -> Result<(), RuntimeError> {
    tracing::info!("Force-killing process {}", pid);

    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(RuntimeError::TerminationFailed {
                    pid,
                    reason: "OpenProcess failed".to_string(),
                });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(RuntimeError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            return Err(RuntimeError::TerminationFailed {
                pid,
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}

/// Hide the console window on Windows; no-op elsewhere.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    cmd
}

/// Central store of live server processes, keyed by server id.
pub struct RuntimeStore {
    processes: Mutex<HashMap<String, Arc<ServerProcess>>>,
}

impl Default for RuntimeStore {
    fn default() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
        }
    }
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, server_id: &str, process: ServerProcess) -> Arc<ServerProcess> {
        let process = Arc::new(process);
        let mut map = self.processes.lock().await;
        map.insert(server_id.to_string(), process.clone());
        process
    }

    pub async fn get(&self, server_id: &str) -> Option<Arc<ServerProcess>> {
        let map = self.processes.lock().await;
        map.get(server_id).cloned()
    }

    pub async fn remove(&self, server_id: &str) -> Option<Arc<ServerProcess>> {
        let mut map = self.processes.lock().await;
        map.remove(server_id)
    }

    /// Server ids whose process has exited but is still registered.
    /// The monitor loop uses this to funnel crash transitions through the
    /// status tracker.
    pub async fn dead_server_ids(&self) -> Vec<String> {
        let map = self.processes.lock().await;
        map.iter()
            .filter(|(_, p)| !p.is_running())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ServerProfile;

    fn snapshot(exe: &str, args: &[&str]) -> ProfileSnapshot {
        let dir = std::env::temp_dir();
        let mut p = ServerProfile::new("test-srv", &dir);
        p.executable_path = Some(exe.to_string());
        p.launch_args = args.iter().map(|s| s.to_string()).collect();
        p.working_dir = Some(dir.to_string_lossy().to_string());
        p.snapshot()
    }

    #[test]
    fn test_launch_without_executable() {
        let dir = std::env::temp_dir();
        let p = ServerProfile::new("test-srv", &dir);
        let err = ServerProcess::launch(&p.snapshot()).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingExecutable));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_on_spawn_without_pattern() {
        let snap = snapshot("sleep", &["5"]);
        let proc = ServerProcess::launch(&snap).unwrap();
        proc.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert!(proc.is_running());
        proc.force_kill().unwrap();
        assert!(proc.wait_exit(Duration::from_secs(5)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_pattern_match() {
        let dir = std::env::temp_dir();
        let mut p = ServerProfile::new("test-srv", &dir);
        p.executable_path = Some("sh".to_string());
        p.launch_args = vec![
            "-c".to_string(),
            "echo booting; echo 'Server is listening'; sleep 5".to_string(),
        ];
        p.working_dir = Some(dir.to_string_lossy().to_string());
        p.ready_pattern = Some("listening".to_string());
        let snap = p.snapshot();

        let proc = ServerProcess::launch(&snap).unwrap();
        proc.wait_ready(Duration::from_secs(5)).await.unwrap();
        proc.force_kill().unwrap();
        assert!(proc.wait_exit(Duration::from_secs(5)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_ready() {
        let dir = std::env::temp_dir();
        let mut p = ServerProfile::new("test-srv", &dir);
        p.executable_path = Some("sh".to_string());
        p.launch_args = vec!["-c".to_string(), "exit 1".to_string()];
        p.working_dir = Some(dir.to_string_lossy().to_string());
        p.ready_pattern = Some("never printed".to_string());
        let snap = p.snapshot();

        let proc = ServerProcess::launch(&snap).unwrap();
        let err = proc.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ExitedBeforeReady));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_tracks_dead_processes() {
        let store = RuntimeStore::new();
        let snap = snapshot("sh", &["-c", "exit 0"]);
        let proc = store.insert("a", ServerProcess::launch(&snap).unwrap()).await;
        assert!(proc.wait_exit(Duration::from_secs(5)).await);

        let dead = store.dead_server_ids().await;
        assert_eq!(dead, vec!["a".to_string()]);
        assert!(store.remove("a").await.is_some());
        assert!(store.get("a").await.is_none());
    }
}
