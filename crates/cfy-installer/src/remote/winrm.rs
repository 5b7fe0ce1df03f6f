use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{ExecOutput, RemoteAuth, RemoteError, RemoteSession, RemoteTarget};

/// Client-side script that relays a command to the target over WinRM.
pub const POWERSHELL_CLIENT_SCRIPT: &str = "bootstrap-client.ps1";

const POWERSHELL: &str = "powershell.exe";

/// Runs commands on a Windows machine through the local PowerShell WinRM
/// bridge script found in the upload directory.
pub struct PowershellSession {
    target: RemoteTarget,
    script: PathBuf,
}

impl PowershellSession {
    /// `powershell_checked` remembers a successful presence check so it runs
    /// once per connector.
    pub async fn open(
        target: &RemoteTarget,
        powershell_checked: &OnceCell<()>,
    ) -> Result<Self, RemoteError> {
        if matches!(target.auth, RemoteAuth::KeyFile(_)) {
            return Err(RemoteError::Unsupported(
                "key file authentication over WinRM".into(),
            ));
        }

        let script = target.local_dir.join(POWERSHELL_CLIENT_SCRIPT);
        if !script.is_file() {
            return Err(RemoteError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "Could not find expected powershell client script in local directory. Was expecting file: {}",
                    script.display()
                ),
            )));
        }

        powershell_checked
            .get_or_try_init(check_powershell_installed)
            .await?;

        Ok(Self {
            target: target.clone(),
            script,
        })
    }

    fn command_line(&self, command: &str) -> Vec<String> {
        vec![
            "-inputformat".into(),
            "none".into(),
            "-File".into(),
            self.script.display().to_string(),
            "-target".into(),
            self.target.host.clone(),
            "-password".into(),
            self.target.auth.password().unwrap_or_default().to_string(),
            "-username".into(),
            self.target.username.clone(),
            "-command".into(),
            command.to_string(),
        ]
    }
}

async fn check_powershell_installed() -> Result<(), RemoteError> {
    debug!("checking if powershell is installed");
    let output = Command::new(POWERSHELL)
        .args(["-inputformat", "none", "-?"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            RemoteError::Unsupported(format!(
                "{POWERSHELL} is not installed or is not on the system path ({e}); \
                 PowerShell is required on both client and server for Windows machines"
            ))
        })?;
    if !output.status.success() {
        return Err(RemoteError::Unsupported(format!(
            "{POWERSHELL} check failed: {}",
            String::from_utf8_lossy(&output.stdout)
        )));
    }
    Ok(())
}

#[async_trait]
impl RemoteSession for PowershellSession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, RemoteError> {
        debug!(host = %self.target.host, "invoking remote powershell command");
        let child = Command::new(POWERSHELL)
            .args(self.command_line(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_status: output.status.code().map_or(u32::MAX, |c| c as u32),
            output: text,
        })
    }

    async fn upload(
        &mut self,
        _remote_path: &str,
        _contents: &[u8],
        _timeout: Duration,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported("file upload over WinRM".into()))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(dir: &std::path::Path) -> RemoteTarget {
        RemoteTarget {
            host: "10.0.0.8".into(),
            username: "Administrator".into(),
            auth: RemoteAuth::Password("secret".into()),
            local_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn missing_client_script_is_reported_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let checked = OnceCell::new();
        let err = PowershellSession::open(&target(dir.path()), &checked)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RemoteError::Io(e) if e.kind() == io::ErrorKind::NotFound));
        assert!(!checked.initialized());
    }

    #[test]
    fn command_line_passes_credentials_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let session = PowershellSession {
            target: target(dir.path()),
            script: dir.path().join(POWERSHELL_CLIENT_SCRIPT),
        };
        let args = session.command_line("$ENV:GSA_MODE='agent';c:\\gs\\run.bat");
        assert_eq!(args[0..2], ["-inputformat", "none"]);
        assert_eq!(args[5], "10.0.0.8");
        assert_eq!(args[7], "secret");
        assert_eq!(args[9], "Administrator");
        assert_eq!(args[11], "$ENV:GSA_MODE='agent';c:\\gs\\run.bat");
    }
}
