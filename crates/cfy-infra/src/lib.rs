pub mod byon;
pub mod context;
pub mod credentials;
pub mod events;
pub mod fly;
pub mod hetzner;
pub mod localcloud;
mod management;
pub mod settings;
pub mod types;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use context::DriverContexts;
use events::ProvisioningListener;
use types::{MachineDetails, MachineId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly provider error: {0}")]
    Fly(#[from] fly_api::Error),

    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    /// Provider-side failure (quota, auth, image missing). Never retried by the core.
    #[error("cloud provisioning failed: {0}")]
    Provisioning(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{operation} is not supported by the {driver} driver")]
    Unsupported {
        driver: ProviderName,
        operation: &'static str,
    },

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid value for env var {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("driver context entry {0:?} holds a value of a different type")]
    ContextType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known provisioning driver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Fly,
    Hetzner,
    Byon,
    LocalCloud,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fly => "fly",
            Self::Hetzner => "hetzner",
            Self::Byon => "byon",
            Self::LocalCloud => "local-cloud",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fly" => Ok(Self::Fly),
            "hetzner" => Ok(Self::Hetzner),
            "byon" => Ok(Self::Byon),
            "local-cloud" | "localcloud" => Ok(Self::LocalCloud),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Operations a driver may or may not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartMachine,
    StopMachine,
    ManagementMachines,
}

/// Describes which operations a driver supports.
///
/// Providers differ wildly here: a local cloud cannot start anything, while
/// a real cloud supports everything. Callers check this before invoking an
/// operation rather than discovering it through an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub start_machine: bool,
    pub stop_machine: bool,
    pub management_machines: bool,
}

impl Capabilities {
    /// Every operation (real clouds).
    pub const FULL: Self = Self {
        start_machine: true,
        stop_machine: true,
        management_machines: true,
    };

    /// Nothing (local cloud).
    pub const NONE: Self = Self {
        start_machine: false,
        stop_machine: false,
        management_machines: false,
    };

    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::StartMachine => self.start_machine,
            Operation::StopMachine => self.stop_machine,
            Operation::ManagementMachines => self.management_machines,
        }
    }
}

/// Provider-agnostic interface for acquiring and releasing machines.
///
/// Every operation has a default that returns [`Error::Unsupported`]; a
/// driver overrides the ones it declares in [`ProvisioningDriver::capabilities`].
#[async_trait]
pub trait ProvisioningDriver: Send + Sync + 'static {
    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Which operations this driver implements.
    fn capabilities(&self) -> Capabilities;

    /// Register a listener for provisioning events.
    fn add_listener(&self, listener: Arc<dyn ProvisioningListener>);

    /// Provision one compute instance and wait until it is reachable.
    async fn start_machine(
        &self,
        _location_id: Option<&str>,
        _timeout: Duration,
    ) -> Result<MachineDetails> {
        Err(unsupported(self.name(), "start_machine"))
    }

    /// Provision the fixed-size management tier. The count comes from driver
    /// configuration.
    async fn start_management_machines(&self, _timeout: Duration) -> Result<Vec<MachineDetails>> {
        Err(unsupported(self.name(), "start_management_machines"))
    }

    /// Terminate a machine. Returns `false` when it was already gone.
    async fn stop_machine(&self, _machine_id: &MachineId, _timeout: Duration) -> Result<bool> {
        Err(unsupported(self.name(), "stop_machine"))
    }

    /// Terminate every management machine this driver knows about.
    async fn stop_management_machines(&self, _timeout: Duration) -> Result<()> {
        Err(unsupported(self.name(), "stop_management_machines"))
    }

    /// Release resources held by the driver.
    async fn close(&self) {}

    /// The underlying provider handle, for callers that need to reach past
    /// the abstraction (tests, mostly).
    fn compute_context(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }
}

/// Await a provider API call, giving up with [`Error::Timeout`] once
/// `deadline` passes.
pub(crate) async fn api_call<T, E>(
    deadline: tokio::time::Instant,
    call: &str,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    Error: From<E>,
{
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout(format!("{call} got no answer in time"))),
    }
}

pub fn unsupported(driver: ProviderName, operation: &'static str) -> Error {
    Error::Unsupported { driver, operation }
}

/// Registry of all configured provisioning drivers.
///
/// Each driver is constructed from environment variables at startup.
/// Drivers whose required env vars are missing are skipped.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<ProviderName, Arc<dyn ProvisioningDriver>>,
}

impl DriverRegistry {
    /// Build every configured driver with fresh per-provider contexts.
    pub async fn from_env() -> Result<Self> {
        build_drivers(&DriverContexts::new()).await
    }

    /// Look up a driver by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn ProvisioningDriver>> {
        self.drivers.get(&name)
    }

    /// List the names of all available drivers.
    pub fn available(&self) -> Vec<ProviderName> {
        self.drivers.keys().copied().collect()
    }
}

/// Build every driver whose required env vars are present.
///
/// Drivers of the same provider share one [`context::DriverClassContext`]
/// from `contexts`. The local cloud driver needs no configuration and is
/// always registered.
pub async fn build_drivers(contexts: &DriverContexts) -> Result<DriverRegistry> {
    dotenvy::dotenv().ok();

    let settings = settings::DriverSettings::from_env()?;
    let mut drivers: HashMap<ProviderName, Arc<dyn ProvisioningDriver>> = HashMap::new();

    match fly::FlyDriver::from_env(settings.clone(), contexts.for_provider(ProviderName::Fly)).await {
        Ok(d) => {
            tracing::info!("registered Fly.io provisioning driver");
            drivers.insert(ProviderName::Fly, Arc::new(d));
        }
        Err(e) => tracing::debug!("skipping Fly.io driver: {e}"),
    }

    match hetzner::HetznerDriver::from_env(
        settings.clone(),
        contexts.for_provider(ProviderName::Hetzner),
    )
    .await
    {
        Ok(d) => {
            tracing::info!("registered Hetzner Cloud provisioning driver");
            drivers.insert(ProviderName::Hetzner, Arc::new(d));
        }
        Err(e) => tracing::debug!("skipping Hetzner driver: {e}"),
    }

    match byon::ByonDriver::from_env(settings, contexts.for_provider(ProviderName::Byon)).await {
        Ok(d) => {
            tracing::info!("registered BYON provisioning driver");
            drivers.insert(ProviderName::Byon, Arc::new(d));
        }
        Err(e) => tracing::debug!("skipping BYON driver: {e}"),
    }

    drivers.insert(
        ProviderName::LocalCloud,
        Arc::new(localcloud::LocalCloudDriver::new()),
    );

    Ok(DriverRegistry { drivers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip_through_display() {
        for name in [
            ProviderName::Fly,
            ProviderName::Hetzner,
            ProviderName::Byon,
            ProviderName::LocalCloud,
        ] {
            assert_eq!(name.to_string().parse::<ProviderName>().unwrap(), name);
        }
        assert!(matches!(
            "openstack".parse::<ProviderName>(),
            Err(Error::UnknownProvider(_))
        ));
    }

    #[test]
    fn capability_sets() {
        assert!(Capabilities::FULL.supports(Operation::ManagementMachines));
        assert!(!Capabilities::NONE.supports(Operation::StartMachine));
        assert!(!Capabilities::NONE.supports(Operation::StopMachine));
    }

    #[tokio::test(start_paused = true)]
    async fn api_calls_stop_at_the_deadline() {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let hung = api_call(deadline, "create server", std::future::pending::<Result<()>>());
        match hung.await {
            Err(Error::Timeout(msg)) => assert!(msg.contains("create server"), "{msg}"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(tokio::time::Instant::now() >= deadline);

        let answered = api_call(deadline + Duration::from_secs(1), "get server", async {
            Ok::<_, Error>(7)
        });
        assert_eq!(answered.await.unwrap(), 7);

        let failed = api_call(deadline + Duration::from_secs(1), "get machine", async {
            Err::<(), _>(Error::Provisioning("quota".into()))
        });
        assert!(matches!(failed.await, Err(Error::Provisioning(_))));
    }
}
