//! Minimal SCP sink client: one file per exec channel (`scp -t`).

use russh::client;
use russh::{Channel, ChannelMsg};
use tracing::debug;

use super::RemoteError;
use crate::command::shell_quote;

pub(super) async fn send_file<H: client::Handler>(
    handle: &client::Handle<H>,
    remote_path: &str,
    contents: &[u8],
) -> Result<(), RemoteError> {
    let name = file_name(remote_path)?;
    let mut channel = handle.channel_open_session().await?;
    channel
        .exec(true, format!("scp -t {}", shell_quote(remote_path)))
        .await?;
    read_ack(&mut channel).await?;

    channel.data(header(contents.len(), name).as_bytes()).await?;
    read_ack(&mut channel).await?;

    channel.data(contents).await?;
    channel.data(&[0u8][..]).await?;
    read_ack(&mut channel).await?;
    channel.eof().await?;

    while let Some(msg) = channel.wait().await {
        if let ChannelMsg::ExitStatus { exit_status } = msg {
            if exit_status != 0 {
                return Err(RemoteError::Protocol(format!(
                    "scp to {remote_path} exited with status {exit_status}"
                )));
            }
        }
    }
    debug!(remote_path, bytes = contents.len(), "file uploaded");
    Ok(())
}

async fn read_ack(channel: &mut Channel<client::Msg>) -> Result<(), RemoteError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => return parse_ack(data),
            Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                debug!(stderr = %String::from_utf8_lossy(data), "scp");
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                return Err(RemoteError::Protocol(format!(
                    "scp exited with status {exit_status} before acknowledging"
                )));
            }
            Some(_) => {}
            None => return Err(RemoteError::Protocol("scp channel closed".into())),
        }
    }
}

/// `C<mode> <length> <name>\n`
fn header(len: usize, name: &str) -> String {
    format!("C0644 {len} {name}\n")
}

/// A zero byte acknowledges; 1 (warning) and 2 (fatal) carry a message.
fn parse_ack(data: &[u8]) -> Result<(), RemoteError> {
    match data.first() {
        Some(0) => Ok(()),
        Some(_) => Err(RemoteError::Protocol(
            String::from_utf8_lossy(&data[1..]).trim().to_string(),
        )),
        None => Err(RemoteError::Protocol("empty scp acknowledgement".into())),
    }
}

fn file_name(remote_path: &str) -> Result<&str, RemoteError> {
    remote_path
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RemoteError::Protocol(format!("not a file path: {remote_path}")))
}
