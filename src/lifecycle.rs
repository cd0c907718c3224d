//! Shutdown triggers: OS signals and the parent process going away.

use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

/// Fire `shutdown` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => tracing::info!("Received {}, shutting down", name),
            Err(e) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                return;
            }
        }
        let _ = shutdown.send(());
    });
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Poll `pid` every `period` and fire `shutdown` once it is gone.
pub async fn watch_parent(pid: u32, period: Duration, shutdown: broadcast::Sender<()>) {
    tracing::info!("Watching parent process {}", pid);

    let mut system = System::new();
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;

        if !process_alive(&mut system, pid) {
            tracing::info!("Parent process {} exited, shutting down", pid);
            let _ = shutdown.send(());
            return;
        }
    }
}

/// Refresh `pid` alone and report whether it still runs. A zombie counts as gone.
fn process_alive(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}
