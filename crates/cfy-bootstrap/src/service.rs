use std::path::Path;
use std::sync::Arc;

use cfy_usm::{ProcessControl, ProcessKiller, ServiceProcess};
use tracing::info;

use crate::Result;

/// Stop the service whose PID is recorded in `pid_file`. Returns whether a
/// running process had to be killed.
pub async fn stop_service(
    pid_file: &Path,
    control: Arc<dyn ProcessControl>,
    killer: &ProcessKiller,
) -> Result<bool> {
    let process = ServiceProcess::from_pid_file(pid_file, control).await?;
    if process.is_service_stopped()? {
        info!(pid = process.pid(), "service is not running");
        return Ok(false);
    }
    killer.kill(process.pid()).await?;
    info!(pid = process.pid(), "service stopped");
    Ok(true)
}
