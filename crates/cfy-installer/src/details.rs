use std::collections::BTreeMap;
use std::path::PathBuf;

use cfy_infra::types::{FileTransferMode, MachineDetails, RemoteExecutionMode, ScriptLanguage};
use uuid::Uuid;

use crate::{Error, Result};

/// Everything the installer needs to turn one machine into a grid agent.
///
/// A template is built once per attempt with [`InstallationDetails::builder`]
/// and copied per machine with [`InstallationDetails::for_machine`]; the
/// copies share nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationDetails {
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub file_transfer_mode: FileTransferMode,
    pub remote_execution_mode: RemoteExecutionMode,
    pub script_language: ScriptLanguage,
    /// Exported to the bootstrap script after the built-in variables.
    pub extra_remote_environment: BTreeMap<String, String>,
    pub is_management: bool,
    pub no_web_services: bool,
    pub reservation_id: Option<Uuid>,
    pub zones: Vec<String>,
    /// Comma-separated lookup service addresses. Defaults to the machine's
    /// private address.
    pub locator: Option<String>,
    pub connect_to_private_ip: bool,
    pub bind_to_private_ip: bool,
    /// Paths relative to `local_dir` that only management machines receive.
    pub management_only_files: Vec<PathBuf>,
    pub cloudify_url: Option<String>,
    pub overrides_url: Option<String>,
    pub template_name: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub delete_remote_directory_contents: bool,
    /// Cloud configuration file name under `remote_dir`, exported to
    /// management machines.
    pub cloud_file: Option<String>,
}

impl InstallationDetails {
    pub fn builder(local_dir: impl Into<PathBuf>) -> InstallationDetailsBuilder {
        InstallationDetailsBuilder::new(local_dir.into())
    }

    /// Copy this template for `machine`. Address, credentials, modes and
    /// remote directory come from the machine; the machine's environment is
    /// merged over the template's extras.
    pub fn for_machine(&self, machine: &MachineDetails) -> Result<Self> {
        if machine.public_address.is_none() && machine.private_address.is_none() {
            return Err(Error::Config(format!("{machine} has no address")));
        }
        let username = machine
            .remote_username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config(format!("{machine} has no remote username")))?;

        let mut extra_remote_environment = self.extra_remote_environment.clone();
        extra_remote_environment.extend(machine.environment.clone());

        Ok(Self {
            local_dir: self.local_dir.clone(),
            remote_dir: machine
                .remote_directory
                .clone()
                .unwrap_or_else(|| self.remote_dir.clone()),
            file_transfer_mode: machine.file_transfer_mode,
            remote_execution_mode: machine.remote_execution_mode,
            script_language: machine.script_language,
            extra_remote_environment,
            is_management: self.is_management,
            no_web_services: self.no_web_services,
            reservation_id: self.reservation_id,
            zones: self.zones.clone(),
            locator: self
                .locator
                .clone()
                .or_else(|| machine.private_address.clone()),
            connect_to_private_ip: self.connect_to_private_ip,
            bind_to_private_ip: self.bind_to_private_ip,
            management_only_files: self.management_only_files.clone(),
            cloudify_url: self.cloudify_url.clone(),
            overrides_url: self.overrides_url.clone(),
            template_name: machine
                .template_name
                .clone()
                .or_else(|| self.template_name.clone()),
            public_ip: machine.public_address.clone(),
            private_ip: machine.private_address.clone(),
            username,
            password: machine.remote_password.clone(),
            key_file: machine.key_file.clone(),
            delete_remote_directory_contents: machine.clean_remote_directory_on_start
                || self.delete_remote_directory_contents,
            cloud_file: self.cloud_file.clone(),
        })
    }

    /// Address the installer connects to.
    pub fn target_host(&self) -> Result<&str> {
        let (preferred, kind) = if self.connect_to_private_ip {
            (&self.private_ip, "private")
        } else {
            (&self.public_ip, "public")
        };
        preferred
            .as_deref()
            .ok_or_else(|| Error::Config(format!("no {kind} address to connect to")))
    }

    /// Address the agent binds to on the machine.
    pub fn machine_ip(&self) -> &str {
        let ip = if self.bind_to_private_ip {
            &self.private_ip
        } else {
            &self.public_ip
        };
        ip.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct InstallationDetailsBuilder {
    details: InstallationDetails,
}

impl InstallationDetailsBuilder {
    fn new(local_dir: PathBuf) -> Self {
        Self {
            details: InstallationDetails {
                local_dir,
                remote_dir: String::new(),
                file_transfer_mode: FileTransferMode::default(),
                remote_execution_mode: RemoteExecutionMode::default(),
                script_language: ScriptLanguage::default(),
                extra_remote_environment: BTreeMap::new(),
                is_management: false,
                no_web_services: false,
                reservation_id: None,
                zones: Vec::new(),
                locator: None,
                connect_to_private_ip: false,
                bind_to_private_ip: true,
                management_only_files: Vec::new(),
                cloudify_url: None,
                overrides_url: None,
                template_name: None,
                public_ip: None,
                private_ip: None,
                username: String::new(),
                password: None,
                key_file: None,
                delete_remote_directory_contents: false,
                cloud_file: None,
            },
        }
    }

    pub fn remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.details.remote_dir = dir.into();
        self
    }

    pub fn management(mut self, is_management: bool) -> Self {
        self.details.is_management = is_management;
        self
    }

    pub fn no_web_services(mut self, no_web_services: bool) -> Self {
        self.details.no_web_services = no_web_services;
        self
    }

    pub fn reservation_id(mut self, id: Uuid) -> Self {
        self.details.reservation_id = Some(id);
        self
    }

    pub fn zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details.zones = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn locator(mut self, locator: impl Into<String>) -> Self {
        self.details.locator = Some(locator.into());
        self
    }

    pub fn connect_to_private_ip(mut self, yes: bool) -> Self {
        self.details.connect_to_private_ip = yes;
        self
    }

    pub fn bind_to_private_ip(mut self, yes: bool) -> Self {
        self.details.bind_to_private_ip = yes;
        self
    }

    pub fn management_only_file(mut self, relative: impl Into<PathBuf>) -> Self {
        self.details.management_only_files.push(relative.into());
        self
    }

    pub fn cloudify_url(mut self, url: impl Into<String>) -> Self {
        self.details.cloudify_url = Some(url.into());
        self
    }

    pub fn overrides_url(mut self, url: impl Into<String>) -> Self {
        self.details.overrides_url = Some(url.into());
        self
    }

    pub fn template_name(mut self, name: impl Into<String>) -> Self {
        self.details.template_name = Some(name.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.details
            .extra_remote_environment
            .insert(name.into(), value.into());
        self
    }

    pub fn delete_remote_directory_contents(mut self, yes: bool) -> Self {
        self.details.delete_remote_directory_contents = yes;
        self
    }

    pub fn cloud_file(mut self, path: impl Into<String>) -> Self {
        self.details.cloud_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<InstallationDetails> {
        let details = self.details;
        if !details.local_dir.is_dir() {
            return Err(Error::Config(format!(
                "local directory {} does not exist or is not a directory",
                details.local_dir.display()
            )));
        }
        if details.remote_dir.is_empty() {
            return Err(Error::Config("remote directory must be set".into()));
        }
        for file in &details.management_only_files {
            if file.is_absolute() {
                return Err(Error::Config(format!(
                    "management-only file {} must be relative to the local directory",
                    file.display()
                )));
            }
        }
        if details.cloud_file.is_some() && !details.is_management {
            return Err(Error::Config(
                "a cloud file is only passed to management machines".into(),
            ));
        }
        Ok(details)
    }
}
