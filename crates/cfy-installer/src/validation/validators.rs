use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{
    LookupLocators, MachineValidator, PortRange, ValidationContext, ValidationMessageType,
    ValidationStage, Verdict,
};
use crate::script_errors::lookup as script_error;
use crate::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What to validate on the local machine.
#[derive(Debug, Clone)]
pub struct ValidationTarget {
    pub host_name: String,
    /// Address the agent will bind to.
    pub nic_address: String,
    /// Unparsed `host[:port],...` list.
    pub lookup_locators: String,
    /// Unparsed `low-high` LRMI port range.
    pub port_range: String,
    pub connect_timeout: Duration,
}

impl ValidationTarget {
    /// Read `NIC_ADDR`, `LOOKUPLOCATORS` and `GSC_LRMI_PORT_RANGE`. The host
    /// name defaults to the NIC address.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let var = |name: &str| {
            std::env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))
        };
        let nic_address = var("NIC_ADDR")?;
        Ok(Self {
            host_name: std::env::var("CFY_HOST_NAME").unwrap_or_else(|_| nic_address.clone()),
            nic_address,
            lookup_locators: var("LOOKUPLOCATORS")?,
            port_range: var("GSC_LRMI_PORT_RANGE")?,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }
}

/// The validators in their fixed order: host name, NIC address, lookup
/// service connectivity, port availability.
pub fn default_validators(target: &ValidationTarget) -> Vec<Box<dyn MachineValidator>> {
    vec![
        Box::new(HostNameValidator {
            host: target.host_name.clone(),
        }),
        Box::new(NicAddressValidator {
            address: target.nic_address.clone(),
        }),
        Box::new(LookupConnectivityValidator {
            locators: target.lookup_locators.clone(),
            connect_timeout: target.connect_timeout,
        }),
        Box::new(PortAvailabilityValidator {
            address: target.nic_address.clone(),
            range: target.port_range.clone(),
        }),
    ]
}

async fn resolve(host: &str) -> Option<IpAddr> {
    if host.is_empty() {
        return None;
    }
    tokio::net::lookup_host((host, 0))
        .await
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

fn failed(validator: &'static str, message: impl Into<String>) -> Error {
    Error::Validation {
        validator,
        message: message.into(),
    }
}

/// The host name resolves to an address.
pub struct HostNameValidator {
    pub host: String,
}

#[async_trait]
impl MachineValidator for HostNameValidator {
    fn name(&self) -> &'static str {
        "host name"
    }

    fn stage(&self) -> ValidationStage {
        ValidationStage::Pre
    }

    async fn validate(&self, ctx: &dyn ValidationContext) -> Result<Verdict> {
        let ip = resolve(&self.host).await.ok_or_else(|| {
            failed(
                self.name(),
                format!("{} ({:?})", script_error(119).message, self.host),
            )
        })?;
        ctx.validation_event(
            ValidationMessageType::Entry,
            &format!("{} resolves to {ip}", self.host),
        );
        Ok(Verdict::Passed)
    }
}

/// The NIC address belongs to this machine: a socket can be bound to it.
pub struct NicAddressValidator {
    pub address: String,
}

#[async_trait]
impl MachineValidator for NicAddressValidator {
    fn name(&self) -> &'static str {
        "NIC address"
    }

    fn stage(&self) -> ValidationStage {
        ValidationStage::Post
    }

    async fn validate(&self, _ctx: &dyn ValidationContext) -> Result<Verdict> {
        let ip = resolve(&self.address).await.ok_or_else(|| {
            failed(
                self.name(),
                format!("{} ({:?})", script_error(121).message, self.address),
            )
        })?;
        match TcpListener::bind(SocketAddr::new(ip, 0)).await {
            Ok(_) => Ok(Verdict::Passed),
            Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => Err(failed(
                self.name(),
                format!("{ip} is not assigned to a local network interface"),
            )),
            Err(e) => Ok(Verdict::Warning(format!(
                "{} ({e})",
                script_error(unexpected_io_code(&e, 122, 123)).message
            ))),
        }
    }
}

/// At least one lookup service is accepting connections.
pub struct LookupConnectivityValidator {
    pub locators: String,
    pub connect_timeout: Duration,
}

#[async_trait]
impl MachineValidator for LookupConnectivityValidator {
    fn name(&self) -> &'static str {
        "lookup service connectivity"
    }

    fn stage(&self) -> ValidationStage {
        ValidationStage::Post
    }

    async fn validate(&self, ctx: &dyn ValidationContext) -> Result<Verdict> {
        let locators: LookupLocators = self.locators.parse()?;
        let mut unreachable = Vec::new();
        for locator in &locators.0 {
            let Some(ip) = resolve(&locator.host).await else {
                unreachable.push(format!("{locator}: {}", script_error(127).message));
                continue;
            };
            let connect = TcpStream::connect(SocketAddr::new(ip, locator.port));
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_)) => {
                    ctx.validation_event(
                        ValidationMessageType::Entry,
                        &format!("lookup service at {locator} is reachable"),
                    );
                }
                Ok(Err(e)) => unreachable.push(format!("{locator}: {e}")),
                Err(_) => unreachable.push(format!("{locator}: connection timed out")),
            }
        }

        debug!(unreachable = unreachable.len(), total = locators.0.len(), "lookup locators checked");
        if unreachable.len() == locators.0.len() {
            return Err(failed(
                self.name(),
                format!("{} {}", script_error(128).message, unreachable.join("; ")),
            ));
        }
        if unreachable.is_empty() {
            Ok(Verdict::Passed)
        } else {
            Ok(Verdict::Warning(format!(
                "some lookup services are unreachable: {}",
                unreachable.join("; ")
            )))
        }
    }
}

/// Some port in the LRMI range can be bound on the NIC address and accepts
/// a connection.
pub struct PortAvailabilityValidator {
    pub address: String,
    pub range: String,
}

#[async_trait]
impl MachineValidator for PortAvailabilityValidator {
    fn name(&self) -> &'static str {
        "port availability"
    }

    fn stage(&self) -> ValidationStage {
        ValidationStage::Pre
    }

    async fn validate(&self, ctx: &dyn ValidationContext) -> Result<Verdict> {
        let range: PortRange = self.range.parse()?;
        let ip = resolve(&self.address).await.ok_or_else(|| {
            failed(
                self.name(),
                format!("{} ({:?})", script_error(124).message, self.address),
            )
        })?;

        for port in range.ports() {
            let listener = match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(listener) => listener,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    return Ok(Verdict::Warning(format!(
                        "{} ({e})",
                        script_error(unexpected_io_code(&e, 125, 126)).message
                    )));
                }
            };
            let connected = TcpStream::connect(SocketAddr::new(ip, port)).await;
            drop(listener);
            if let Err(e) = connected {
                return Ok(Verdict::Warning(format!(
                    "{} ({e})",
                    script_error(125).message
                )));
            }
            ctx.validation_event(
                ValidationMessageType::Entry,
                &format!("port {port} in range {range} is available"),
            );
            return Ok(Verdict::Passed);
        }
        Err(failed(
            self.name(),
            format!("no free port in range {range} on {ip}"),
        ))
    }
}

/// Permission problems and other I/O failures have separate messages.
fn unexpected_io_code(e: &io::Error, io_code: u32, permission_code: u32) -> u32 {
    if e.kind() == io::ErrorKind::PermissionDenied {
        permission_code
    } else {
        io_code
    }
}
