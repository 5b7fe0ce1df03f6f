use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::servers_api;
use hcloud::models;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::DriverClassContext;
use crate::credentials::resolve_credentials;
use crate::events::{EventPublisher, ProvisioningListener, names};
use crate::settings::DriverSettings;
use crate::types::{MachineDetails, MachineId, MachineState};
use crate::{Capabilities, Error, ProviderName, ProvisioningDriver, Result, api_call};

const CONFIGURATION_KEY: &str = "api-configuration";
const ROLE_LABEL: &str = "cloudify-role";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Budget for deleting a server that failed to start.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Management,
    Agent,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::Management => "management",
            Self::Agent => "agent",
        }
    }
}

/// Hetzner Cloud driver using the `hcloud` crate.
///
/// All configuration is loaded from environment variables via `from_env()`.
/// The API configuration is shared by every Hetzner driver through the
/// driver class context.
pub struct HetznerDriver {
    config: Arc<Configuration>,
    settings: DriverSettings,
    location: String,
    server_type: String,
    image: String,
    network_id: Option<i64>,
    firewall_id: Option<i64>,
    ssh_key_names: Vec<String>,
    events: EventPublisher,
    agents: AtomicUsize,
}

impl HetznerDriver {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    /// - `HETZNER_SERVER_TYPE` (default: `"cpx21"`)
    /// - `HETZNER_IMAGE` (default: `"ubuntu-22.04"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer)
    /// - `HETZNER_FIREWALL_ID` (optional, integer)
    /// - `HETZNER_SSH_KEY_NAMES` (comma-separated names, optional)
    pub async fn from_env(settings: DriverSettings, ctx: Arc<DriverClassContext>) -> Result<Self> {
        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let config = ctx
            .get_or_create(CONFIGURATION_KEY, || async move {
                let mut config = Configuration::new();
                config.bearer_access_token = Some(token);
                debug!("hetzner: api configuration created");
                Ok(config)
            })
            .await?;

        let location = std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".into());
        let server_type = std::env::var("HETZNER_SERVER_TYPE").unwrap_or_else(|_| "cpx21".into());
        let image = std::env::var("HETZNER_IMAGE").unwrap_or_else(|_| "ubuntu-22.04".into());

        let network_id = crate::settings::parse_var::<i64>("HETZNER_NETWORK_ID")?;
        let firewall_id = crate::settings::parse_var::<i64>("HETZNER_FIREWALL_ID")?;

        let ssh_key_names: Vec<String> = std::env::var("HETZNER_SSH_KEY_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            config,
            settings,
            location,
            server_type,
            image,
            network_id,
            firewall_id,
            ssh_key_names,
            events: EventPublisher::default(),
            agents: AtomicUsize::new(0),
        })
    }

    fn parse_state(status: &models::server::Status) -> MachineState {
        match status {
            models::server::Status::Running => MachineState::Running,
            models::server::Status::Initializing | models::server::Status::Starting => {
                MachineState::Starting
            }
            models::server::Status::Off | models::server::Status::Stopping => MachineState::Stopped,
            models::server::Status::Deleting => MachineState::Destroyed,
            _ => MachineState::Unknown,
        }
    }

    fn private_ip(server: &models::Server) -> Option<String> {
        server.private_net.first().and_then(|net| net.ip.clone())
    }

    fn public_ip(server: &models::Server) -> Option<String> {
        server.public_net.ipv4.as_ref().map(|v4| v4.ip.clone())
    }

    fn parse_id(raw: &str) -> Result<i64> {
        raw.parse::<i64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }

    fn labels(role: Role) -> HashMap<String, String> {
        HashMap::from([(ROLE_LABEL.to_string(), role.label().to_string())])
    }

    fn is_not_found(e: &impl std::fmt::Display) -> bool {
        e.to_string().contains("404")
    }

    async fn list_servers(&self, role: Role, deadline: Instant) -> Result<Vec<models::Server>> {
        let list = servers_api::list_servers(
            &self.config,
            servers_api::ListServersParams {
                label_selector: Some(format!("{ROLE_LABEL}={}", role.label())),
                ..Default::default()
            },
        );
        let resp = api_call(deadline, "hetzner list servers", async {
            list.await
                .map_err(|e| Error::HetznerApi(format!("list servers: {e}")))
        })
        .await?;
        Ok(resp.servers)
    }

    async fn create_server(
        &self,
        name: &str,
        role: Role,
        location: Option<&str>,
        deadline: Instant,
    ) -> Result<i64> {
        let firewalls = self.firewall_id.map(|fw_id| {
            vec![models::CreateServerRequestFirewalls { firewall: fw_id }]
        });

        let ssh_keys = if self.ssh_key_names.is_empty() {
            None
        } else {
            Some(self.ssh_key_names.clone())
        };

        let create = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: name.to_string(),
                    server_type: self.server_type.clone(),
                    image: self.image.clone(),
                    location: Some(location.unwrap_or(&self.location).to_string()),
                    user_data: None,
                    networks: self.network_id.map(|id| vec![id]),
                    firewalls,
                    ssh_keys,
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: Some(Self::labels(role)),
                    placement_group: None,
                    public_net: None,
                },
            },
        );
        let resp = api_call(deadline, "hetzner create server", async {
            create
                .await
                .map_err(|e| Error::Provisioning(format!("hetzner create server {name}: {e}")))
        })
        .await?;

        info!(server_id = resp.server.id, name, "hetzner: server created");
        Ok(resp.server.id)
    }

    /// Poll until the server is running and has an address. Returns the
    /// public and private addresses.
    async fn wait_until_running(
        &self,
        server_id: i64,
        deadline: Instant,
    ) -> Result<(Option<String>, Option<String>)> {
        loop {
            let get = servers_api::get_server(
                &self.config,
                servers_api::GetServerParams { id: server_id },
            );
            let resp = api_call(deadline, "hetzner get server", async {
                get.await
                    .map_err(|e| Error::HetznerApi(format!("get server: {e}")))
            })
            .await?;

            if let Some(server) = resp.server {
                let state = Self::parse_state(&server.status);
                let public = Self::public_ip(&server);
                let private = Self::private_ip(&server);
                let reachable = public.is_some() || private.is_some();
                match state {
                    MachineState::Running if reachable => return Ok((public, private)),
                    MachineState::Destroyed => {
                        return Err(Error::Provisioning(format!(
                            "hetzner server {server_id} was deleted while starting"
                        )));
                    }
                    _ => debug!(server_id, ?state, "hetzner: waiting for server"),
                }
            }

            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(Error::Timeout(format!(
                    "hetzner server {server_id} did not reach running state"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Create a server and wait for it, deleting it again if it never
    /// becomes usable.
    async fn launch(
        &self,
        name: &str,
        role: Role,
        location: Option<&str>,
        timeout: Duration,
    ) -> Result<MachineDetails> {
        let deadline = Instant::now() + timeout;
        let server_id = self.create_server(name, role, location, deadline).await?;

        let (public_address, private_address) = match self.wait_until_running(server_id, deadline).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(server_id, error = %e, "hetzner: server failed to start, deleting it");
                let cleanup = Instant::now() + CLEANUP_TIMEOUT;
                if let Err(del) = self.delete_server(server_id, cleanup).await {
                    warn!(server_id, error = %del, "hetzner: failed to delete half-created server");
                }
                return Err(e);
            }
        };

        let machine = MachineDetails {
            machine_id: Some(MachineId(server_id.to_string())),
            public_address,
            private_address,
            location_id: Some(location.unwrap_or(&self.location).to_string()),
            ..self.settings.machine_template()
        };
        resolve_credentials(machine, self.settings.key_file.as_deref())
    }

    async fn delete_server(&self, server_id: i64, deadline: Instant) -> Result<bool> {
        let delete = servers_api::delete_server(
            &self.config,
            servers_api::DeleteServerParams { id: server_id },
        );
        let outcome = api_call(deadline, "hetzner delete server", async {
            Ok::<_, Error>(delete.await)
        })
        .await?;
        if let Err(e) = outcome {
            if Self::is_not_found(&e) {
                warn!(server_id, "hetzner: server already destroyed");
                return Ok(false);
            }
            return Err(Error::HetznerApi(format!("delete server: {e}")));
        }

        info!(server_id, "hetzner: server destroyed");
        Ok(true)
    }
}

#[async_trait]
impl ProvisioningDriver for HetznerDriver {
    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn add_listener(&self, listener: Arc<dyn ProvisioningListener>) {
        self.events.add(listener);
    }

    async fn start_machine(&self, location_id: Option<&str>, timeout: Duration) -> Result<MachineDetails> {
        let index = self.agents.fetch_add(1, Ordering::Relaxed) + 1;
        let name = self.settings.agent_name(index);
        self.events.publish(names::STARTING_MACHINE, &[name.clone()]);

        match self.launch(&name, Role::Agent, location_id, timeout).await {
            Ok(machine) => {
                self.events
                    .publish(names::MACHINE_STARTED, &[machine.to_string()]);
                Ok(machine)
            }
            Err(e) => {
                self.events
                    .publish(names::MACHINE_START_FAILED, &[name, e.to_string()]);
                Err(e)
            }
        }
    }

    async fn start_management_machines(&self, timeout: Duration) -> Result<Vec<MachineDetails>> {
        self.events
            .publish(names::ATTEMPT_CONNECTION_TO_CLOUD_API, &[self.location.clone()]);
        let deadline = Instant::now() + timeout;
        let existing = self.list_servers(Role::Management, deadline).await?;
        self.events
            .publish(names::CONNECTION_TO_CLOUD_API_SUCCEEDED, &[self.location.clone()]);

        if !existing.is_empty() {
            let found: Vec<&str> = existing.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::Provisioning(format!(
                "found existing management servers: {}",
                found.join(", ")
            )));
        }

        crate::management::start_management_machines(
            self.settings.management_machines,
            &self.events,
            |index| {
                let name = self.settings.management_name(index);
                async move { self.launch(&name, Role::Management, None, timeout).await }
            },
            |id| async move {
                let cleanup = Instant::now() + CLEANUP_TIMEOUT;
                self.delete_server(Self::parse_id(&id.0)?, cleanup).await
            },
        )
        .await
    }

    async fn stop_machine(&self, machine_id: &MachineId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let server_id = Self::parse_id(&machine_id.0)?;
        self.events
            .publish(names::STOPPING_MACHINE, &[machine_id.to_string()]);
        let deleted = self.delete_server(server_id, deadline).await?;
        if deleted {
            self.events
                .publish(names::MACHINE_STOPPED, &[machine_id.to_string()]);
        }
        Ok(deleted)
    }

    async fn stop_management_machines(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let servers = self.list_servers(Role::Management, deadline).await?;
        for server in servers {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("stopping hetzner management servers".into()));
            }
            self.delete_server(server.id, deadline).await?;
        }
        Ok(())
    }

    fn compute_context(&self) -> Option<&(dyn std::any::Any + Send + Sync)> {
        Some(self.config.as_ref())
    }
}
