//! Copying the local upload directory to the machine.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use cfy_infra::types::RemoteExecutionMode;

use crate::command::{EnvironmentFileBuilder, normalize_cifs_path, powershell_quote, shell_quote};
use crate::deadline::Deadline;
use crate::details::InstallationDetails;
use crate::error::Phase;
use crate::remote::RemoteSession;
use crate::{Error, Result};

/// A local file and its path relative to the upload directory, with `/`
/// separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub relative: String,
}

/// Files under `details.local_dir` that this machine should receive, sorted
/// by relative path. Agent machines never get management-only files or the
/// private key file.
pub async fn collect_files(details: &InstallationDetails) -> Result<Vec<LocalFile>> {
    let root = &details.local_dir;
    let key_file = match (&details.key_file, details.is_management) {
        (Some(key), false) => Some(canonical(key).await),
        _ => None,
    };

    let mut files = Vec::new();
    let mut pending = vec![root.clone()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| local_error(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| local_error(&dir, e))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| local_error(&path, e))?;
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if !details.is_management && is_management_only(relative, &details.management_only_files) {
                debug!(file = %relative.display(), "skipping management-only file");
                continue;
            }
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if key_file.as_deref() == Some(canonical(&path).await.as_path()) {
                debug!(file = %relative.display(), "not uploading key file to agent machine");
                continue;
            }
            files.push(LocalFile {
                relative: relative_string(relative),
                path,
            });
        }
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Shell command that makes `remote_dir` exist, emptied first when `clean`.
pub fn prepare_directory_command(remote_dir: &str, clean: bool) -> String {
    let dir = shell_quote(remote_dir);
    if clean {
        format!("if [ -d {dir} ]; then rm -rf {dir}; fi; mkdir -p {dir}")
    } else {
        format!("if [ ! -d {dir} ]; then mkdir -p {dir}; fi")
    }
}

/// PowerShell command that makes `remote_dir` and `subdirs` exist, emptying
/// `remote_dir` first when `clean`. Share paths (`/C$/gs`) become drive
/// paths (`C:\gs`).
pub fn prepare_windows_directory_command(
    remote_dir: &str,
    subdirs: &BTreeSet<String>,
    clean: bool,
) -> String {
    let root = normalize_cifs_path(remote_dir);
    let mut steps = Vec::with_capacity(subdirs.len() + 2);
    if clean {
        let dir = powershell_quote(&root);
        steps.push(format!(
            "if (Test-Path -LiteralPath {dir}) {{ Remove-Item -LiteralPath {dir} -Recurse -Force }}"
        ));
    }
    let dirs = std::iter::once(root.clone())
        .chain(subdirs.iter().map(|sub| format!("{root}\\{}", sub.replace('/', "\\"))));
    for dir in dirs {
        steps.push(format!(
            "New-Item -ItemType Directory -Force -Path {} | Out-Null",
            powershell_quote(&dir)
        ));
    }
    steps.join("; ")
}

/// Parent directories, relative to the upload root, that `files` need.
pub fn subdirectories(files: &[LocalFile]) -> BTreeSet<String> {
    files
        .iter()
        .filter_map(|f| f.relative.rsplit_once('/').map(|(parent, _)| parent.to_string()))
        .collect()
}

/// Make the remote directory tree for `files` exist, running commands in
/// the shell dialect of `mode` on `session`.
pub async fn prepare_remote_directory(
    session: &mut dyn RemoteSession,
    mode: RemoteExecutionMode,
    details: &InstallationDetails,
    files: &[LocalFile],
    host: &str,
    deadline: Deadline,
) -> Result<()> {
    let remote_dir = details.remote_dir.trim_end_matches('/');
    let subdirs = subdirectories(files);
    let clean = details.delete_remote_directory_contents;
    let commands = match mode {
        RemoteExecutionMode::Ssh => {
            let mut commands = vec![prepare_directory_command(remote_dir, clean)];
            if !subdirs.is_empty() {
                commands.push(subdirs.iter().fold(String::from("mkdir -p"), |mut cmd, dir| {
                    cmd.push(' ');
                    cmd.push_str(&shell_quote(&format!("{remote_dir}/{dir}")));
                    cmd
                }));
            }
            commands
        }
        RemoteExecutionMode::Winrm => {
            vec![prepare_windows_directory_command(remote_dir, &subdirs, clean)]
        }
    };

    for command in commands {
        let output = session
            .exec(&command, budget(deadline, host)?)
            .await
            .map_err(|e| e.into_installer(Phase::Upload, host))?;
        if !output.success() {
            return Err(Error::installer(
                Phase::Upload,
                host,
                format!("failed to prepare remote directory {remote_dir}: {}", output.output.trim()),
            ));
        }
    }
    Ok(())
}

/// Send every collected file, then the environment file. Parent
/// directories must already exist. Returns the number of files written.
pub async fn send_files(
    session: &mut dyn RemoteSession,
    details: &InstallationDetails,
    files: &[LocalFile],
    env_file: &EnvironmentFileBuilder,
    host: &str,
    deadline: Deadline,
) -> Result<usize> {
    let remote_dir = details.remote_dir.trim_end_matches('/');
    let remote = |e: crate::remote::RemoteError| e.into_installer(Phase::Upload, host);

    for file in files {
        let contents = tokio::fs::read(&file.path)
            .await
            .map_err(|e| local_error(&file.path, e))?;
        let target = format!("{remote_dir}/{}", file.relative);
        debug!(host, file = %target, bytes = contents.len(), "uploading");
        session
            .upload(&target, &contents, budget(deadline, host)?)
            .await
            .map_err(remote)?;
    }

    let env_path = format!("{remote_dir}/{}", env_file.file_name());
    session
        .upload(&env_path, env_file.contents().as_bytes(), budget(deadline, host)?)
        .await
        .map_err(remote)?;

    info!(host, files = files.len() + 1, remote_dir, "upload complete");
    Ok(files.len() + 1)
}

fn budget(deadline: Deadline, host: &str) -> Result<Duration> {
    let remaining = deadline.remaining();
    if remaining.is_zero() {
        return Err(Error::Timeout {
            phase: Phase::Upload,
            host: host.to_string(),
        });
    }
    Ok(remaining)
}

fn is_management_only(relative: &Path, management_only: &[PathBuf]) -> bool {
    management_only.iter().any(|m| relative.starts_with(m))
}

fn relative_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

fn local_error(path: &Path, e: std::io::Error) -> Error {
    Error::installer(
        Phase::Upload,
        "local",
        format!("failed to read local path {}", path.display()),
    )
    .with_source(e)
}
