use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Error;

/// Opaque provider-side machine identifier (e.g. Fly Machine ID or Hetzner Server ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How files are copied onto a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileTransferMode {
    #[default]
    Scp,
    Sftp,
    Cifs,
}

impl FileTransferMode {
    /// Port the transfer endpoint listens on.
    pub fn port(&self) -> u16 {
        match self {
            Self::Scp | Self::Sftp => 22,
            Self::Cifs => 445,
        }
    }
}

impl FromStr for FileTransferMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "scp" => Ok(Self::Scp),
            "sftp" => Ok(Self::Sftp),
            "cifs" => Ok(Self::Cifs),
            other => Err(Error::Provisioning(format!("unknown file transfer mode: {other}"))),
        }
    }
}

/// How commands are run on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteExecutionMode {
    #[default]
    Ssh,
    Winrm,
}

impl RemoteExecutionMode {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ssh => 22,
            Self::Winrm => 5985,
        }
    }
}

impl FromStr for RemoteExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "winrm" => Ok(Self::Winrm),
            other => Err(Error::Provisioning(format!("unknown remote execution mode: {other}"))),
        }
    }
}

/// Language of the scripts shipped to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    #[default]
    LinuxShell,
    WindowsBatch,
}

impl ScriptLanguage {
    pub fn newline(&self) -> &'static str {
        match self {
            Self::LinuxShell => "\n",
            Self::WindowsBatch => "\r\n",
        }
    }

    pub fn script_extension(&self) -> &'static str {
        match self {
            Self::LinuxShell => "sh",
            Self::WindowsBatch => "bat",
        }
    }
}

/// A provisioned compute instance, as returned by a driver.
///
/// Created once by [`crate::ProvisioningDriver::start_machine`] and handed to
/// the installer. Only the credentials may change afterwards, see
/// [`MachineDetails::with_key_file`].
#[derive(Debug, Clone, Default)]
pub struct MachineDetails {
    pub machine_id: Option<MachineId>,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub location_id: Option<String>,
    pub template_name: Option<String>,
    pub remote_username: Option<String>,
    pub remote_password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub remote_directory: Option<String>,
    pub file_transfer_mode: FileTransferMode,
    pub remote_execution_mode: RemoteExecutionMode,
    pub script_language: ScriptLanguage,
    pub clean_remote_directory_on_start: bool,
    pub agent_running: bool,
    pub cloudify_installed: bool,
    pub environment: BTreeMap<String, String>,
}

impl MachineDetails {
    /// Address used to reach the machine, preferring the private one when asked.
    pub fn address(&self, private: bool) -> Option<&str> {
        let (first, second) = if private {
            (&self.private_address, &self.public_address)
        } else {
            (&self.public_address, &self.private_address)
        };
        first.as_deref().or(second.as_deref())
    }

    /// Replace the credentials with a key file, dropping any password.
    pub fn with_key_file(mut self, key_file: PathBuf) -> Self {
        self.key_file = Some(key_file);
        self.remote_password = None;
        self
    }
}

impl fmt::Display for MachineDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "machine [id={}, public={}, private={}, agent_running={}]",
            self.machine_id.as_ref().map(|id| id.0.as_str()).unwrap_or("-"),
            self.public_address.as_deref().unwrap_or("-"),
            self.private_address.as_deref().unwrap_or("-"),
            self.agent_running,
        )
    }
}

/// Provider-reported machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Starting,
    Running,
    Stopped,
    Destroyed,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_falls_back_to_other_interface() {
        let md = MachineDetails {
            public_address: Some("1.2.3.4".into()),
            ..Default::default()
        };
        assert_eq!(md.address(true), Some("1.2.3.4"));
        assert_eq!(md.address(false), Some("1.2.3.4"));

        let md = MachineDetails {
            public_address: Some("1.2.3.4".into()),
            private_address: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert_eq!(md.address(true), Some("10.0.0.2"));
        assert_eq!(md.address(false), Some("1.2.3.4"));
    }

    #[test]
    fn key_file_replaces_password() {
        let md = MachineDetails {
            remote_password: Some("secret".into()),
            ..Default::default()
        }
        .with_key_file(PathBuf::from("/tmp/id.pem"));
        assert!(md.remote_password.is_none());
        assert_eq!(md.key_file.as_deref(), Some(std::path::Path::new("/tmp/id.pem")));
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("SCP".parse::<FileTransferMode>().unwrap(), FileTransferMode::Scp);
        assert_eq!("WinRM".parse::<RemoteExecutionMode>().unwrap(), RemoteExecutionMode::Winrm);
        assert!("ftp".parse::<FileTransferMode>().is_err());
    }
}
