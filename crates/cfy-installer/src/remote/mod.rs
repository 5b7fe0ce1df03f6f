//! Remote shell and file transfer behind one session interface.
//!
//! A [`Connector`] opens [`RemoteSession`]s for a [`RemoteTarget`]: an exec
//! session for the configured remote execution mode (SSH or WinRM) and a
//! transfer session for the file transfer mode (SCP, or CIFS for Windows
//! shares; SFTP is declared but not available).

mod cifs;
mod scp;
mod ssh;
mod winrm;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfy_infra::types::{FileTransferMode, RemoteExecutionMode};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

use crate::error::{Error, Phase};
use crate::retry::Transient;

pub use cifs::{CifsSession, unc_path};
pub use ssh::SshSession;
pub use winrm::{POWERSHELL_CLIENT_SCRIPT, PowershellSession};

/// Failure of a single remote operation, before it is attributed to an
/// installation phase.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("could not resolve host {host}")]
    Resolve { host: String },

    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("timed out")]
    Timeout,

    #[error("authentication rejected for user {user}")]
    AuthRejected { user: String },

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("transfer protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} is not supported")]
    Unsupported(String),
}

impl Transient for RemoteError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Resolve { .. } | Self::Timeout => true,
            Self::Connect(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ),
            _ => false,
        }
    }
}

impl RemoteError {
    /// Attribute this error to `phase` on `host`.
    pub fn into_installer(self, phase: Phase, host: &str) -> Error {
        match self {
            Self::Timeout => Error::Timeout {
                phase,
                host: host.to_string(),
            },
            Self::Unsupported(what) => Error::Unsupported(what),
            other => {
                let message = other.to_string();
                Error::installer(phase, host, message).with_source(other)
            }
        }
    }
}

/// Credentials for a remote login: exactly one of a password or a key file.
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteAuth {
    Password(String),
    KeyFile(PathBuf),
}

impl std::fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

impl RemoteAuth {
    /// Validate a password/key-file pair for `host`. Empty values count as
    /// absent. Runs before any network call.
    pub fn from_parts(
        host: &str,
        password: Option<&str>,
        key_file: Option<&Path>,
    ) -> crate::Result<Self> {
        let password = password.filter(|p| !p.is_empty());
        let key_file = key_file.filter(|k| !k.as_os_str().is_empty());
        match (password, key_file) {
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "both a password and a key file were supplied for {host}, expected exactly one"
            ))),
            (None, None) => Err(Error::Config(format!(
                "neither a password nor a key file was supplied for {host}"
            ))),
            (Some(password), None) => Ok(Self::Password(password.to_string())),
            (None, Some(key_file)) => {
                if !key_file.is_file() {
                    return Err(Error::installer(
                        Phase::Configuration,
                        host,
                        format!("Expected to find key file at: {}", key_file.display()),
                    ));
                }
                Ok(Self::KeyFile(key_file.to_path_buf()))
            }
        }
    }

    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password(p) => Some(p),
            Self::KeyFile(_) => None,
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub username: String,
    pub auth: RemoteAuth,
    /// Local directory holding client-side helper scripts (WinRM bridge).
    pub local_dir: PathBuf,
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: u32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An open connection to a remote machine.
///
/// Callers must call [`RemoteSession::close`] on every path; dropping a
/// session without closing it still tears down the transport.
#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, RemoteError>;

    /// Write `contents` to `remote_path`. Parent directories must exist.
    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        timeout: Duration,
    ) -> Result<(), RemoteError>;

    async fn close(&mut self);
}

/// Opens sessions and probes ports. The seam tests replace.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve `host` and open (then drop) a TCP connection to `port`.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<(), RemoteError>;

    async fn open_exec(
        &self,
        target: &RemoteTarget,
        mode: RemoteExecutionMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;

    async fn open_transfer(
        &self,
        target: &RemoteTarget,
        mode: FileTransferMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Real network connector: russh for SSH and SCP, the `smb` client for CIFS,
/// a local PowerShell bridge for WinRM.
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector {
    powershell_checked: Arc<OnceCell<()>>,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<(), RemoteError> {
        let connect = async {
            let mut addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|_| RemoteError::Resolve {
                    host: host.to_string(),
                })?;
            let addr = addrs.next().ok_or_else(|| RemoteError::Resolve {
                host: host.to_string(),
            })?;
            TcpStream::connect(addr).await.map_err(RemoteError::Connect)?;
            Ok::<(), RemoteError>(())
        };
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn open_exec(
        &self,
        target: &RemoteTarget,
        mode: RemoteExecutionMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        match mode {
            RemoteExecutionMode::Ssh => Ok(Box::new(SshSession::connect(target, timeout).await?)),
            RemoteExecutionMode::Winrm => Ok(Box::new(
                PowershellSession::open(target, &self.powershell_checked).await?,
            )),
        }
    }

    async fn open_transfer(
        &self,
        target: &RemoteTarget,
        mode: FileTransferMode,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        match mode {
            FileTransferMode::Scp => Ok(Box::new(SshSession::connect(target, timeout).await?)),
            FileTransferMode::Sftp => Err(RemoteError::Unsupported("SFTP file transfer".into())),
            FileTransferMode::Cifs => Ok(Box::new(CifsSession::connect(target, timeout).await?)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake;
