use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use smb::transport::TransportError;
use smb::{
    Client, ClientConfig, ConnectionConfig, CreateOptions, FileAttributes, FileCreateArgs,
    Resource, UncPath, WriteAt,
};
use tracing::debug;

use super::{ExecOutput, RemoteAuth, RemoteError, RemoteSession, RemoteTarget};

/// Writes files to a Windows administrative share over SMB.
///
/// Remote paths name the share as their first component, the way the
/// installer spells Windows directories: `/C$/Users/gs/run.bat` is `run.bat`
/// in `Users\gs` on share `C$`.
pub struct CifsSession {
    client: Option<Client>,
    host: String,
    username: String,
    password: String,
    shares: BTreeSet<String>,
}

impl CifsSession {
    /// Negotiate an SMB connection with the target. Shares are mounted on
    /// first use.
    pub async fn connect(target: &RemoteTarget, timeout: Duration) -> Result<Self, RemoteError> {
        let RemoteAuth::Password(password) = &target.auth else {
            return Err(RemoteError::Unsupported(
                "key file authentication over CIFS".into(),
            ));
        };
        let client = Client::new(ClientConfig {
            connection: ConnectionConfig {
                timeout: Some(timeout),
                ..Default::default()
            },
            ..Default::default()
        });
        tokio::time::timeout(timeout, client.connect(&target.host))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(smb_error)?;

        debug!(host = %target.host, "smb connection established");
        Ok(Self {
            client: Some(client),
            host: target.host.clone(),
            username: target.username.clone(),
            password: password.clone(),
            shares: BTreeSet::new(),
        })
    }

    fn client(&self) -> Result<&Client, RemoteError> {
        self.client
            .as_ref()
            .ok_or_else(|| RemoteError::Protocol("session already closed".into()))
    }

    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        let path = unc_path(&self.host, remote_path)?;
        let share = path.share().unwrap_or_default().to_string();
        if !self.shares.contains(&share) {
            let share_root = path.clone().with_no_path();
            self.client()?
                .share_connect(&share_root, &self.username, self.password.clone())
                .await
                .map_err(smb_error)?;
            debug!(host = %self.host, share = %share, "share connected");
            self.shares.insert(share);
        }

        let args = FileCreateArgs::make_overwrite(FileAttributes::new(), CreateOptions::new());
        let file = match self.client()?.create_file(&path, &args).await.map_err(smb_error)? {
            Resource::File(file) => file,
            _ => {
                return Err(RemoteError::Protocol(format!("{path} is not a regular file")));
            }
        };

        let mut written = 0;
        let outcome = async {
            while written < contents.len() {
                let n = file
                    .write_at(&contents[written..], written as u64)
                    .await
                    .map_err(smb_error)?;
                if n == 0 {
                    return Err(RemoteError::Protocol(format!("server accepted no bytes for {path}")));
                }
                written += n;
            }
            Ok(())
        }
        .await;
        if let Err(e) = file.close().await {
            debug!(host = %self.host, file = %path, error = %e, "smb close failed");
        }
        outcome
    }
}

/// Map an installer remote path (`/C$/gs/run.bat`) to a UNC path on `host`.
pub fn unc_path(host: &str, remote_path: &str) -> Result<UncPath, RemoteError> {
    let trimmed = remote_path.trim_start_matches(['/', '\\']);
    let (share, path) = trimmed.split_once(['/', '\\']).unwrap_or((trimmed, ""));
    if share.is_empty() || path.is_empty() {
        return Err(RemoteError::Protocol(format!(
            "{remote_path} does not name a file on a share"
        )));
    }
    let unc = UncPath::new(host)
        .and_then(|unc| unc.with_share(share))
        .map_err(|e| RemoteError::Protocol(e.to_string()))?;
    Ok(unc.with_path(path))
}

fn smb_error(e: smb::Error) -> RemoteError {
    match e {
        smb::Error::IoError(io) => RemoteError::Connect(io),
        smb::Error::TransportError(TransportError::IoError(io)) => RemoteError::Connect(io),
        smb::Error::TransportError(TransportError::Timeout(_)) => RemoteError::Timeout,
        smb::Error::TransportError(TransportError::InvalidAddress(host)) => {
            RemoteError::Resolve { host }
        }
        other => RemoteError::Protocol(format!("smb: {other}")),
    }
}

#[async_trait]
impl RemoteSession for CifsSession {
    async fn exec(&mut self, _command: &str, _timeout: Duration) -> Result<ExecOutput, RemoteError> {
        Err(RemoteError::Unsupported("running commands over CIFS".into()))
    }

    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        debug!(host = %self.host, file = remote_path, "smb upload");
        tokio::time::timeout(timeout, self.write_file(remote_path, contents))
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                debug!(host = %self.host, error = %e, "smb disconnect failed");
            }
        }
    }
}
