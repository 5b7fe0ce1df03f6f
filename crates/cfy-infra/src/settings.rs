use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::types::{FileTransferMode, MachineDetails, RemoteExecutionMode, ScriptLanguage};
use crate::{Error, Result};

/// Settings shared by every driver, describing the machines it hands out.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub machine_prefix: String,
    pub management_machines: usize,
    pub template_name: String,
    pub remote_username: String,
    pub remote_password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub remote_directory: String,
    pub clean_remote_directory_on_start: bool,
    pub file_transfer_mode: FileTransferMode,
    pub remote_execution_mode: RemoteExecutionMode,
    pub script_language: ScriptLanguage,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            machine_prefix: "cloudify-".into(),
            management_machines: 1,
            template_name: "SMALL_LINUX".into(),
            remote_username: "root".into(),
            remote_password: None,
            key_file: None,
            remote_directory: "/tmp/gs-files".into(),
            clean_remote_directory_on_start: false,
            file_transfer_mode: FileTransferMode::Scp,
            remote_execution_mode: RemoteExecutionMode::Ssh,
            script_language: ScriptLanguage::LinuxShell,
        }
    }
}

impl DriverSettings {
    /// Load from env vars, falling back to [`Default`] for anything unset:
    ///
    /// - `CFY_MACHINE_PREFIX`, `CFY_MANAGEMENT_MACHINES`, `CFY_TEMPLATE`
    /// - `CFY_REMOTE_USERNAME`, `CFY_REMOTE_PASSWORD`, `CFY_KEY_FILE`
    /// - `CFY_REMOTE_DIR`, `CFY_CLEAN_REMOTE_DIR`
    /// - `CFY_FILE_TRANSFER` (`scp`), `CFY_REMOTE_EXECUTION` (`ssh`)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let remote_execution_mode = parse_var("CFY_REMOTE_EXECUTION")?
            .unwrap_or(defaults.remote_execution_mode);
        let script_language = match remote_execution_mode {
            RemoteExecutionMode::Ssh => ScriptLanguage::LinuxShell,
            RemoteExecutionMode::Winrm => ScriptLanguage::WindowsBatch,
        };

        Ok(Self {
            machine_prefix: env::var("CFY_MACHINE_PREFIX").unwrap_or(defaults.machine_prefix),
            management_machines: parse_var("CFY_MANAGEMENT_MACHINES")?
                .unwrap_or(defaults.management_machines),
            template_name: env::var("CFY_TEMPLATE").unwrap_or(defaults.template_name),
            remote_username: env::var("CFY_REMOTE_USERNAME").unwrap_or(defaults.remote_username),
            remote_password: env::var("CFY_REMOTE_PASSWORD").ok().filter(|s| !s.is_empty()),
            key_file: env::var("CFY_KEY_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            remote_directory: env::var("CFY_REMOTE_DIR").unwrap_or(defaults.remote_directory),
            clean_remote_directory_on_start: parse_bool_var("CFY_CLEAN_REMOTE_DIR")?
                .unwrap_or(defaults.clean_remote_directory_on_start),
            file_transfer_mode: parse_var("CFY_FILE_TRANSFER")?
                .unwrap_or(defaults.file_transfer_mode),
            remote_execution_mode,
            script_language,
        })
    }

    /// Name for the `index`th (1-based) management machine.
    pub fn management_name(&self, index: usize) -> String {
        format!("{}management-{index}", self.machine_prefix)
    }

    /// Name for the `index`th agent machine.
    pub fn agent_name(&self, index: usize) -> String {
        format!("{}agent-{index}", self.machine_prefix)
    }

    /// Machine details pre-filled from the template, before the provider
    /// has assigned addresses or an id.
    pub fn machine_template(&self) -> MachineDetails {
        MachineDetails {
            template_name: Some(self.template_name.clone()),
            remote_username: Some(self.remote_username.clone()),
            remote_password: self.remote_password.clone(),
            remote_directory: Some(self.remote_directory.clone()),
            file_transfer_mode: self.file_transfer_mode,
            remote_execution_mode: self.remote_execution_mode,
            script_language: self.script_language,
            clean_remote_directory_on_start: self.clean_remote_directory_on_start,
            agent_running: false,
            cloudify_installed: false,
            ..Default::default()
        }
    }
}

/// Parse an optional env var, failing on a present but malformed value.
pub(crate) fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidEnv {
                var: name.to_string(),
                value: raw,
            }),
        _ => Ok(None),
    }
}

pub(crate) fn parse_bool_var(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(Error::InvalidEnv {
                var: name.to_string(),
                value: raw,
            }),
        },
        Err(_) => Ok(None),
    }
}
