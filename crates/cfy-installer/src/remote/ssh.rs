use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::net::TcpStream;
use tracing::debug;

use super::{ExecOutput, RemoteAuth, RemoteError, RemoteSession, RemoteTarget, scp};

const SSH_PORT: u16 = 22;

/// Freshly provisioned machines have host keys nobody has seen yet, so
/// every key is accepted.
pub(super) struct AcceptAnyHost;

#[async_trait]
impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH connection. Serves both remote commands and SCP
/// uploads.
pub struct SshSession {
    handle: Option<client::Handle<AcceptAnyHost>>,
    host: String,
}

impl SshSession {
    pub async fn connect(target: &RemoteTarget, timeout: Duration) -> Result<Self, RemoteError> {
        tokio::time::timeout(timeout, Self::establish(target))
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn establish(target: &RemoteTarget) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect((target.host.as_str(), SSH_PORT))
            .await
            .map_err(RemoteError::Connect)?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        let mut handle = client::connect_stream(config, stream, AcceptAnyHost).await?;

        let authenticated = match &target.auth {
            RemoteAuth::Password(password) => {
                handle
                    .authenticate_password(&target.username, password)
                    .await?
            }
            RemoteAuth::KeyFile(path) => {
                let key = russh_keys::load_secret_key(path, None)?;
                handle
                    .authenticate_publickey(&target.username, Arc::new(key))
                    .await?
            }
        };
        if !authenticated {
            return Err(RemoteError::AuthRejected {
                user: target.username.clone(),
            });
        }

        debug!(host = %target.host, user = %target.username, "ssh session established");
        Ok(Self {
            handle: Some(handle),
            host: target.host.clone(),
        })
    }

    fn handle(&self) -> Result<&client::Handle<AcceptAnyHost>, RemoteError> {
        self.handle
            .as_ref()
            .ok_or_else(|| RemoteError::Protocol("session already closed".into()))
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let mut channel = self.handle()?.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let exit_status = exit_status.ok_or_else(|| {
            RemoteError::Protocol("remote command ended without an exit status".into())
        })?;
        Ok(ExecOutput {
            exit_status,
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, RemoteError> {
        debug!(host = %self.host, "executing remote command");
        tokio::time::timeout(timeout, self.run(command))
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        let handle = self.handle()?;
        tokio::time::timeout(timeout, scp::send_file(handle, remote_path, contents))
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(host = %self.host, error = %e, "ssh disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::Handler;

    #[tokio::test]
    async fn any_host_key_is_accepted() {
        let key = russh_keys::key::KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();
        assert!(AcceptAnyHost.check_server_key(&key).await.unwrap());
    }
}
