use std::sync::Arc;

use warden_core::config::GlobalConfig;
use warden_core::dispatch::Coordinator;
use warden_core::ipc::IpcServer;
use warden_core::preflight::NullHostServices;
use warden_core::upgrade::CommandUpdateProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Lifecycle coordinator starting");

    let config = match GlobalConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            GlobalConfig::default()
        }
    };
    let listen_addr = config.listen_addr.clone();

    let provider = Arc::new(CommandUpdateProvider::new(
        config.update_tool.clone(),
        config.update_tool_args.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        config,
        Arc::new(NullHostServices),
        provider,
    ));
    if let Err(e) = coordinator.initialize() {
        tracing::error!("Failed to initialize coordinator: {}", e);
        return Err(e);
    }

    // Funnel observed process exits through the status tracker so a crashed
    // server comes back as Stopped instead of a phantom Running.
    let monitor = coordinator.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            monitor.observe_exits().await;
        }
    });

    // Admin console on stdin: the same command grammar the chat relay uses.
    let console = coordinator.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            for reply in warden_core::relay::handle_line(&console, &line).await {
                println!("{}", reply);
            }
        }
    });

    // Graceful shutdown: cancel any in-flight upgrade so its cleanup runs
    // before the process exits.
    let shutdown = coordinator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
        if shutdown.cancel_upgrade() {
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        }
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = IpcServer::new(coordinator, &listen_addr);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("Lifecycle coordinator shutting down");
    Ok(())
}
