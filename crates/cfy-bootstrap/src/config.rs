use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cfy_infra::ProviderName;
use cfy_installer::InstallationDetails;
use uuid::Uuid;

use crate::{Error, Result};

/// Zone every management machine joins.
pub const MANAGEMENT_ZONE: &str = "management";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub provider: ProviderName,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub bootstrap_timeout: Duration,
    pub teardown_timeout: Duration,
    pub cloudify_url: Option<String>,
    pub overrides_url: Option<String>,
    pub rest_port: u16,
    pub connect_to_private_ip: bool,
    pub cloud_file: Option<String>,
    pub management_only_files: Vec<PathBuf>,
}

impl BootstrapConfig {
    /// Load from the process environment (and `.env`, if present).
    ///
    /// `CFY_PROVIDER` is required. Everything else has a default:
    /// `CFY_LOCAL_DIR` (`upload`), `CFY_REMOTE_DIR` (`/tmp/gs-files`),
    /// `CFY_BOOTSTRAP_TIMEOUT_SECS` (1800), `CFY_TEARDOWN_TIMEOUT_SECS` (600),
    /// `CFY_REST_PORT` (8100), `CFY_CONNECT_TO_PRIVATE_IP` (false). The
    /// optional `CFY_CLOUDIFY_URL`, `CFY_OVERRIDES_URL`, `CFY_CLOUD_FILE`
    /// and `CFY_MANAGEMENT_ONLY_FILES` (comma separated) are passed through.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let provider = var("CFY_PROVIDER")
            .ok_or_else(|| Error::Config("CFY_PROVIDER must be set".into()))?
            .trim()
            .parse::<ProviderName>()?;

        Ok(Self {
            provider,
            local_dir: var("CFY_LOCAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("upload")),
            remote_dir: var("CFY_REMOTE_DIR").unwrap_or_else(|| "/tmp/gs-files".into()),
            bootstrap_timeout: Duration::from_secs(
                parse(&var, "CFY_BOOTSTRAP_TIMEOUT_SECS")?.unwrap_or(1800),
            ),
            teardown_timeout: Duration::from_secs(
                parse(&var, "CFY_TEARDOWN_TIMEOUT_SECS")?.unwrap_or(600),
            ),
            cloudify_url: var("CFY_CLOUDIFY_URL"),
            overrides_url: var("CFY_OVERRIDES_URL"),
            rest_port: parse(&var, "CFY_REST_PORT")?.unwrap_or(8100),
            connect_to_private_ip: parse_bool(&var, "CFY_CONNECT_TO_PRIVATE_IP")?.unwrap_or(false),
            cloud_file: var("CFY_CLOUD_FILE"),
            management_only_files: var("CFY_MANAGEMENT_ONLY_FILES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Template for management machine installations. Each bootstrap gets
    /// a fresh reservation id.
    pub fn installation_template(&self) -> Result<InstallationDetails> {
        let mut builder = InstallationDetails::builder(&self.local_dir)
            .remote_dir(&self.remote_dir)
            .management(true)
            .zones([MANAGEMENT_ZONE])
            .connect_to_private_ip(self.connect_to_private_ip)
            .reservation_id(Uuid::new_v4());
        if let Some(url) = &self.cloudify_url {
            builder = builder.cloudify_url(url);
        }
        if let Some(url) = &self.overrides_url {
            builder = builder.overrides_url(url);
        }
        if let Some(file) = &self.cloud_file {
            builder = builder.cloud_file(file);
        }
        for file in &self.management_only_files {
            builder = builder.management_only_file(file);
        }
        Ok(builder.build()?)
    }
}

fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}")))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    var(name)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::Config(format!("invalid value for {name}: {raw:?}"))),
        })
        .transpose()
}
