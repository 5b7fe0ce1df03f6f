//! In-memory connector used by the installer tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cfy_infra::types::{FileTransferMode, RemoteExecutionMode};
use tokio::time::Instant;

use super::{Connector, ExecOutput, RemoteError, RemoteSession, RemoteTarget};

/// One operation as seen by the fake, with the budget it was given.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: &'static str,
    pub timeout: Duration,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct FakeRemote {
    pub files: BTreeMap<String, Vec<u8>>,
    pub commands: Vec<String>,
    pub calls: Vec<Call>,
    pub open_sessions: usize,
    pub refused_probes: usize,
    /// Session opens to refuse before accepting, as sshd does while it
    /// starts up.
    pub refused_opens: usize,
    pub exec_modes: Vec<RemoteExecutionMode>,
    pub transfer_modes: Vec<FileTransferMode>,
}

/// Simulated machine: a flat remote file system keyed by path, plus fixed
/// durations for each kind of operation (meant for a paused clock).
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub remote: Arc<Mutex<FakeRemote>>,
    pub op_delay: Duration,
    pub exec_exit_status: u32,
}

impl FakeConnector {
    pub fn with_delay(op_delay: Duration) -> Self {
        Self {
            op_delay,
            ..Default::default()
        }
    }

    pub fn remote(&self) -> std::sync::MutexGuard<'_, FakeRemote> {
        self.remote.lock().unwrap()
    }

    fn record(&self, op: &'static str, timeout: Duration) {
        self.remote().calls.push(Call {
            op,
            timeout,
            at: Instant::now(),
        });
    }

    /// Sleep for the configured delay, failing like a real call would if
    /// the budget is smaller.
    async fn spend(&self, timeout: Duration) -> Result<(), RemoteError> {
        if self.op_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RemoteError::Timeout);
        }
        tokio::time::sleep(self.op_delay).await;
        Ok(())
    }

    async fn open(&self, op: &'static str, timeout: Duration) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.record(op, timeout);
        self.spend(timeout).await?;
        let mut remote = self.remote();
        if remote.refused_opens > 0 {
            remote.refused_opens -= 1;
            return Err(RemoteError::Connect(std::io::ErrorKind::ConnectionRefused.into()));
        }
        remote.open_sessions += 1;
        drop(remote);
        Ok(Box::new(FakeSession {
            connector: self.clone(),
        }))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn probe(&self, _host: &str, _port: u16, timeout: Duration) -> Result<(), RemoteError> {
        self.record("probe", timeout);
        self.spend(timeout).await?;
        let mut remote = self.remote();
        if remote.refused_probes > 0 {
            remote.refused_probes -= 1;
            return Err(RemoteError::Connect(std::io::ErrorKind::ConnectionRefused.into()));
        }
        Ok(())
    }

    async fn open_exec(
        &self,
        _target: &RemoteTarget,
        mode: RemoteExecutionMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let session = self.open("open_exec", timeout).await?;
        self.remote().exec_modes.push(mode);
        Ok(session)
    }

    async fn open_transfer(
        &self,
        _target: &RemoteTarget,
        mode: FileTransferMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let session = self.open("open_transfer", timeout).await?;
        self.remote().transfer_modes.push(mode);
        Ok(session)
    }
}

struct FakeSession {
    connector: FakeConnector,
}

/// Argument of the first `rm -rf` in a command, unquoted.
fn removed_dir(command: &str) -> Option<String> {
    let rest = command.split("rm -rf ").nth(1)?;
    let arg = rest.split(';').next()?.trim();
    Some(arg.trim_matches('\'').to_string())
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, RemoteError> {
        self.connector.record("exec", timeout);
        self.connector.spend(timeout).await?;
        let mut remote = self.connector.remote();
        remote.commands.push(command.to_string());
        if let Some(dir) = removed_dir(command) {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            remote.files.retain(|path, _| !path.starts_with(&prefix));
        }
        Ok(ExecOutput {
            exit_status: if command.contains("bootstrap-management") {
                self.connector.exec_exit_status
            } else {
                0
            },
            output: String::new(),
        })
    }

    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        self.connector.record("upload", timeout);
        self.connector.spend(timeout).await?;
        self.connector
            .remote()
            .files
            .insert(remote_path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        self.connector.remote().open_sessions -= 1;
    }
}
