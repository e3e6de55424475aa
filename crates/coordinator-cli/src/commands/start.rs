//! `coordinatord start` — run the coordinator in the foreground until a
//! termination signal arrives, periodically sweeping dead agents (§6).

use crate::pidfile;
use coordinator_core::Context;
use std::time::Duration;

pub async fn run(ctx: Context, cleanup_interval_secs: u64) -> anyhow::Result<i32> {
    let path = pidfile::pidfile_path()?;
    let _pidfile = pidfile::acquire(&path)?;
    tracing::info!(pid = std::process::id(), pidfile = %path.display(), "coordinatord started");

    let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval_secs.max(1)));
    interval.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match ctx.agent_registry.cleanup_dead_agents(900).await {
                    Ok(report) => tracing::info!(
                        agents_cleaned = report.agents_cleaned,
                        locks_released = report.locks_released,
                        "dead-agent cleanup sweep"
                    ),
                    Err(err) => tracing::warn!(error = %err, "dead-agent cleanup sweep failed"),
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("coordinatord received shutdown signal");
                break;
            }
        }
    }

    std::fs::remove_file(&path).ok();
    Ok(0)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
