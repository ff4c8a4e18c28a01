use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ipam_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// health stays BAD until the api & store monitor survive the stabilization window
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    monitor_task: &mut JoinHandle<()>,
) -> Result<()> {
    verify_background_task_running("admin API", api_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("store monitor", monitor_task)
        .await
        .context("startup check failed")?;
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}
