use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::DriverClassContext;
use crate::credentials::resolve_credentials;
use crate::events::{EventPublisher, ProvisioningListener, names};
use crate::settings::DriverSettings;
use crate::types::{MachineDetails, MachineId, MachineState};
use crate::{Capabilities, Error, ProviderName, ProvisioningDriver, Result, api_call};

const CLIENT_KEY: &str = "api-client";
const ROLE_KEY: &str = "cloudify-role";
const MANAGEMENT_ROLE: &str = "management";
const AGENT_ROLE: &str = "agent";
/// Budget for deleting a machine that failed to start.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fly.io Machines API driver.
///
/// Delegates to `fly_api::FlyClient` for all HTTP calls. One client is
/// shared by every Fly driver through the driver class context.
pub struct FlyDriver {
    client: Arc<fly_api::FlyClient>,
    settings: DriverSettings,
    region: String,
    image: String,
    events: EventPublisher,
    agents: AtomicUsize,
}

impl FlyDriver {
    /// Create from env vars: `FLY_API_TOKEN` (required), `FLY_APP_NAME`,
    /// `FLY_REGION`, `FLY_IMAGE`, `FLY_API_URL`.
    pub async fn from_env(settings: DriverSettings, ctx: Arc<DriverClassContext>) -> Result<Self> {
        let token = std::env::var("FLY_API_TOKEN")
            .map_err(|_| Error::MissingEnv("FLY_API_TOKEN".into()))?;
        let app = std::env::var("FLY_APP_NAME").unwrap_or_else(|_| "cloudify-machines".into());
        let region = std::env::var("FLY_REGION").unwrap_or_else(|_| "iad".into());
        let image = std::env::var("FLY_IMAGE").unwrap_or_else(|_| "ubuntu:22.04".into());
        let api_url = std::env::var("FLY_API_URL").ok();

        let client = ctx
            .get_or_create(CLIENT_KEY, || async move {
                debug!(app = %app, "fly: api client created");
                let client = fly_api::FlyClient::new(token, app);
                Ok(match api_url {
                    Some(url) => client.with_base_url(url),
                    None => client,
                })
            })
            .await?;

        Ok(Self::with_client(client, settings, region, image))
    }

    fn with_client(
        client: Arc<fly_api::FlyClient>,
        settings: DriverSettings,
        region: String,
        image: String,
    ) -> Self {
        Self {
            client,
            settings,
            region,
            image,
            events: EventPublisher::default(),
            agents: AtomicUsize::new(0),
        }
    }

    fn parse_state(state: &str) -> MachineState {
        match state {
            "started" => MachineState::Running,
            "created" | "starting" => MachineState::Starting,
            "stopped" | "stopping" | "suspended" => MachineState::Stopped,
            "destroyed" | "destroying" => MachineState::Destroyed,
            _ => MachineState::Unknown,
        }
    }

    fn address(&self, machine: &fly_api::Machine) -> String {
        machine
            .private_ip
            .clone()
            .unwrap_or_else(|| format!("{}.vm.{}.internal", machine.id, self.client.app()))
    }

    fn guest_config() -> fly_api::GuestConfig {
        fly_api::GuestConfig {
            cpus: 2,
            cpu_kind: "shared".into(),
            memory_mb: 2048,
        }
    }

    /// Wait for the machine to start, one bounded `/wait` call at a time.
    async fn wait_until_started(&self, machine_id: &str, deadline: Instant) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("fly machine {machine_id} did not start")));
            }
            let wait = self
                .client
                .wait_for_state(machine_id, fly_api::MachineState::Started, remaining);
            match tokio::time::timeout(remaining, wait).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_wait_timeout() => {
                    debug!(machine_id, "fly: still waiting for machine to start");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::Timeout(format!("fly machine {machine_id} did not start")));
                }
            }
        }
    }

    async fn launch(
        &self,
        name: String,
        role: &str,
        region: Option<&str>,
        timeout: Duration,
    ) -> Result<MachineDetails> {
        let deadline = Instant::now() + timeout;
        let region = region.unwrap_or(&self.region).to_string();

        let request = fly_api::CreateMachineRequest {
            name: name.clone(),
            region: region.clone(),
            config: fly_api::MachineConfig {
                image: self.image.clone(),
                env: None,
                guest: Self::guest_config(),
                metadata: HashMap::from([(ROLE_KEY.to_string(), role.to_string())]),
                auto_destroy: Some(false),
            },
        };
        let machine = api_call(deadline, "fly create machine", async {
            self.client
                .create_machine(&request)
                .await
                .map_err(|e| Error::Provisioning(format!("fly create machine {name}: {e}")))
        })
        .await?;

        info!(machine_id = %machine.id, state = %machine.state, "fly: machine created");

        let started = match self.wait_until_started(&machine.id, deadline).await {
            Ok(()) => api_call(deadline, "fly get machine", self.client.get_machine(&machine.id)).await,
            Err(e) => Err(e),
        };
        let machine = match started {
            Ok(m) => m,
            Err(e) => {
                warn!(machine_id = %machine.id, error = %e, "fly: machine failed to start, deleting it");
                let cleanup = Instant::now() + CLEANUP_TIMEOUT;
                if let Err(del) = self.destroy(&machine.id, cleanup).await {
                    warn!(machine_id = %machine.id, error = %del, "fly: failed to delete half-created machine");
                }
                return Err(e);
            }
        };

        let address = self.address(&machine);
        let details = MachineDetails {
            machine_id: Some(MachineId(machine.id)),
            public_address: Some(address.clone()),
            private_address: Some(address),
            location_id: Some(region),
            ..self.settings.machine_template()
        };
        resolve_credentials(details, self.settings.key_file.as_deref())
    }

    async fn destroy(&self, machine_id: &str, deadline: Instant) -> Result<bool> {
        let deleted = api_call(
            deadline,
            "fly delete machine",
            self.client.delete_machine(machine_id, true),
        )
        .await?;
        if deleted {
            info!(machine_id, "fly: machine destroyed");
        } else {
            warn!(machine_id, "fly: machine already destroyed");
        }
        Ok(deleted)
    }

    fn is_management(machine: &fly_api::Machine) -> bool {
        machine.metadata(ROLE_KEY) == Some(MANAGEMENT_ROLE)
            && Self::parse_state(&machine.state) != MachineState::Destroyed
    }
}

#[async_trait]
impl ProvisioningDriver for FlyDriver {
    fn name(&self) -> ProviderName {
        ProviderName::Fly
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

        match self.launch(name.clone(), AGENT_ROLE, location_id, timeout).await {
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
            .publish(names::ATTEMPT_CONNECTION_TO_CLOUD_API, &[self.client.app().to_string()]);
        let deadline = Instant::now() + timeout;
        let existing: Vec<String> = api_call(deadline, "fly list machines", self.client.list_machines())
            .await?
            .into_iter()
            .filter(Self::is_management)
            .map(|m| m.name)
            .collect();
        self.events
            .publish(names::CONNECTION_TO_CLOUD_API_SUCCEEDED, &[self.client.app().to_string()]);

        if !existing.is_empty() {
            return Err(Error::Provisioning(format!(
                "found existing management machines: {}",
                existing.join(", ")
            )));
        }

        crate::management::start_management_machines(
            self.settings.management_machines,
            &self.events,
            |index| self.launch(self.settings.management_name(index), MANAGEMENT_ROLE, None, timeout),
            |id| async move { self.destroy(&id.0, Instant::now() + CLEANUP_TIMEOUT).await },
        )
        .await
    }

    async fn stop_machine(&self, machine_id: &MachineId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        self.events
            .publish(names::STOPPING_MACHINE, &[machine_id.to_string()]);
        let deleted = self.destroy(&machine_id.0, deadline).await?;
        if deleted {
            self.events
                .publish(names::MACHINE_STOPPED, &[machine_id.to_string()]);
        }
        Ok(deleted)
    }

    async fn stop_management_machines(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let machines = api_call(deadline, "fly list machines", self.client.list_machines()).await?;
        for machine in machines.iter().filter(|m| Self::is_management(m)) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("stopping fly management machines".into()));
            }
            self.destroy(&machine.id, deadline).await?;
        }
        Ok(())
    }

    fn compute_context(&self) -> Option<&(dyn std::any::Any + Send + Sync)> {
        Some(self.client.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn machine(state: &str, role: Option<&str>) -> fly_api::Machine {
        let mut json = serde_json::json!({
            "id": "148e",
            "name": "cloudify-management-1",
            "state": state,
            "region": "iad",
        });
        if let Some(role) = role {
            json["config"] = serde_json::json!({ "metadata": { "cloudify-role": role } });
        }
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn machine_states() {
        assert_eq!(FlyDriver::parse_state("started"), MachineState::Running);
        assert_eq!(FlyDriver::parse_state("created"), MachineState::Starting);
        assert_eq!(FlyDriver::parse_state("suspended"), MachineState::Stopped);
        assert_eq!(FlyDriver::parse_state("destroying"), MachineState::Destroyed);
        assert_eq!(FlyDriver::parse_state("replacing"), MachineState::Unknown);
    }

    #[test]
    fn management_machines_are_found_by_metadata() {
        assert!(FlyDriver::is_management(&machine("started", Some("management"))));
        assert!(!FlyDriver::is_management(&machine("started", Some("agent"))));
        assert!(!FlyDriver::is_management(&machine("destroyed", Some("management"))));
        assert!(!FlyDriver::is_management(&machine("started", None)));
    }

    const CREATED: &str = r#"{"id":"148e","name":"cloudify-agent-1","state":"created","region":"iad"}"#;

    /// A Machines API that creates and deletes machines but never answers
    /// `/wait`. Records `METHOD path` for every request.
    async fn serve_stalled_api(listener: TcpListener, requests: Arc<Mutex<Vec<String>>>) {
        while let Ok((stream, _)) = listener.accept().await {
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                loop {
                    let mut request_line = String::new();
                    if stream.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let mut content_length = 0;
                    loop {
                        let mut header = String::new();
                        if stream.read_line(&mut header).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if header == "\r\n" {
                            break;
                        }
                        if let Some((name, value)) = header.split_once(':') {
                            if name.eq_ignore_ascii_case("content-length") {
                                content_length = value.trim().parse().unwrap();
                            }
                        }
                    }
                    let mut body = vec![0; content_length];
                    stream.read_exact(&mut body).await.unwrap();

                    let mut parts = request_line.split_whitespace();
                    let method = parts.next().unwrap_or_default();
                    let path = parts.next().unwrap_or_default().split('?').next().unwrap_or_default();
                    requests.lock().unwrap().push(format!("{method} {path}"));
                    if path.ends_with("/wait") {
                        std::future::pending::<()>().await;
                    }

                    let reply = if method == "POST" { CREATED } else { "{}" };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{reply}",
                        reply.len()
                    );
                    stream.get_mut().write_all(response.as_bytes()).await.unwrap();
                }
            });
        }
    }

    async fn stalled_driver() -> (FlyDriver, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v1", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_stalled_api(listener, requests.clone()));

        let client = fly_api::FlyClient::new("token", "cfy").with_base_url(url);
        let driver = FlyDriver::with_client(
            Arc::new(client),
            DriverSettings::default(),
            "iad".into(),
            "ubuntu:22.04".into(),
        );
        (driver, requests)
    }

    #[tokio::test]
    async fn machines_that_never_start_are_deleted() {
        let (driver, requests) = stalled_driver().await;

        let err = driver
            .start_machine(None, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
        assert_eq!(
            *requests.lock().unwrap(),
            [
                "POST /v1/apps/cfy/machines",
                "GET /v1/apps/cfy/machines/148e/wait",
                "DELETE /v1/apps/cfy/machines/148e",
            ]
        );
    }
}
