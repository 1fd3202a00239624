use anyhow::Result;
use console::style;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::info;

use super::Workspace;
use crate::core::brain::{AgentProgress, ChannelObserver, ProgressEvent};
use crate::core::lifecycle::LifecycleManager;
use crate::core::runtime::ServicesComponent;
use crate::core::terminal::{GuideSection, print_info, print_warn};
use crate::logging;

const PROGRESS_CAPACITY: usize = 256;

fn log_progress(progress: &AgentProgress) {
    match &progress.event {
        ProgressEvent::Iteration { step, max } => {
            info!("[{}] iteration {}/{}", progress.agent_id, step, max)
        }
        ProgressEvent::ToolCall { name, .. } => info!("[{}] -> {}", progress.agent_id, name),
        ProgressEvent::Aborted => info!("[{}] loop stopped on cancel", progress.agent_id),
        _ => {}
    }
}

/// Foreground daemon: scheduler poller plus auto-start services until Ctrl+C.
pub async fn run_daemon() -> Result<()> {
    let workspace = Workspace::open().await?;
    logging::init_tracing(&workspace.config.logging.level, false);

    let observer = Arc::new(ChannelObserver::new(PROGRESS_CAPACITY));
    let mut progress = observer.subscribe();
    tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(event) => log_progress(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let runtime = workspace.runtime(observer).await?;
    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ServicesComponent::new(runtime.clone()))));

    let scheduler_config = &workspace.config.scheduler;
    if scheduler_config.enabled {
        runtime.scheduler().install(&lifecycle, scheduler_config).await?;
    } else {
        print_warn("Scheduler disabled in config.toml; tasks will not be dispatched.");
    }

    lifecycle.start().await?;

    let agents = workspace.store.list_agents().await?;
    GuideSection::new("taskcrew running")
        .status("Data dir", &workspace.data_dir.display().to_string())
        .status("Agents", &agents.len().to_string())
        .status(
            "Poll interval",
            &format!("{}s", scheduler_config.poll_interval_secs),
        )
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    print_info("Shutting down...");
    lifecycle.shutdown().await?;
    Ok(())
}
