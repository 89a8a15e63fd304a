//! Text command relay — translates chat-style lines (`start <alias>`,
//! `status <alias>`, ...) into dispatches and renders the outcome as
//! plain text lines for whatever bridge carries them.

use std::sync::Arc;

use crate::dispatch::{Coordinator, DispatchOptions, DispatchOutcome, Intent};

const USAGE: &str = "usage: list | start|stop|upgrade|backup|reset|status <server> [--yes]";

/// Handle one inbound command line. Always returns at least one reply line.
pub async fn handle_line(coordinator: &Arc<Coordinator>, line: &str) -> Vec<String> {
    let mut parts = line.split_whitespace();
    let verb = match parts.next() {
        Some(v) => v.to_ascii_lowercase(),
        None => return vec![USAGE.to_string()],
    };
    let args: Vec<&str> = parts.collect();
    let confirmed = args.iter().any(|a| *a == "--yes" || *a == "-y");
    let key = match args.iter().find(|a| !a.starts_with('-')) {
        Some(k) => *k,
        None => {
            if verb == "list" {
                return render_list(coordinator).await;
            }
            return vec![USAGE.to_string()];
        }
    };

    let intent = match verb.as_str() {
        "start" => Intent::Start,
        "stop" => Intent::Stop,
        "upgrade" | "update" => Intent::Upgrade,
        "backup" => Intent::Backup,
        "reset" | "restart" => Intent::Reset,
        "status" => return render_status(coordinator, key).await,
        _ => return vec![USAGE.to_string()],
    };

    let opts = DispatchOptions {
        confirmed,
        ..Default::default()
    };
    let outcome = coordinator.dispatch(key, intent, opts).await;
    render_outcome(&outcome)
}

fn render_outcome(outcome: &DispatchOutcome) -> Vec<String> {
    match outcome {
        DispatchOutcome::Completed { message } => vec![message.clone()],
        DispatchOutcome::ConfirmRequired { reason } => vec![
            reason.clone(),
            "re-send the command with --yes to confirm".to_string(),
        ],
        DispatchOutcome::Rejected { reason } => vec![format!("rejected: {}", reason)],
        DispatchOutcome::Cancelled => vec!["operation cancelled".to_string()],
        DispatchOutcome::Failed { message, recoverable } => {
            let mut lines = vec![format!("failed: {}", message)];
            if *recoverable {
                lines.push("you can retry this operation".to_string());
            }
            lines
        }
    }
}

async fn render_status(coordinator: &Arc<Coordinator>, key: &str) -> Vec<String> {
    match coordinator.resolve_snapshot(key) {
        Some(snapshot) => {
            let status = coordinator.status.get(&snapshot.identity.server_id);
            vec![format!("{}: {}", snapshot.identity.display_name, status)]
        }
        None => vec![format!("unknown server '{}'", key)],
    }
}

async fn render_list(coordinator: &Arc<Coordinator>) -> Vec<String> {
    let rows = coordinator.overview().await;
    if rows.is_empty() {
        return vec!["no servers configured".to_string()];
    }
    rows.into_iter()
        .map(|r| match r.pid {
            Some(pid) => format!("{}: {} (pid {})", r.name, r.status, pid),
            None => format!("{}: {}", r.name, r.status),
        })
        .collect()
}
