//! Management tier bring-up and teardown.
//!
//! Bootstrap starts the management machines through the driver, installs
//! every one of them concurrently, then waits for the REST gateway on the
//! machine that runs web services. Any failure after the machines exist
//! stops them again before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use cfy_infra::types::MachineDetails;
use cfy_infra::{Operation, ProvisioningDriver};
use cfy_installer::registration::wait_for_registration;
use cfy_installer::{
    AgentlessInstaller, Deadline, GridMembership, InstallReport, InstallationDetails, Phase,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A bootstrapped management tier.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub machines: Vec<MachineDetails>,
    /// One report per machine, in the driver's order.
    pub installs: Vec<InstallReport>,
}

pub struct Coordinator {
    driver: Arc<dyn ProvisioningDriver>,
    installer: AgentlessInstaller,
    membership: Arc<dyn GridMembership>,
    rollback_timeout: Duration,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        driver: Arc<dyn ProvisioningDriver>,
        installer: AgentlessInstaller,
        membership: Arc<dyn GridMembership>,
    ) -> Self {
        Self {
            driver,
            installer,
            membership,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Budget for stopping machines after a failed bootstrap. Independent of
    /// the bootstrap timeout, which may already be spent.
    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bring up the management tier within `timeout`. `template` is copied
    /// for every machine the driver starts.
    pub async fn bootstrap(
        &self,
        template: &InstallationDetails,
        timeout: Duration,
    ) -> Result<BootstrapOutcome> {
        let driver = self.driver.name();
        if !self
            .driver
            .capabilities()
            .supports(Operation::ManagementMachines)
        {
            return Err(cfy_infra::unsupported(driver, "bootstrap").into());
        }

        let deadline = Deadline::after(timeout);
        info!(%driver, ?timeout, "starting management machines");
        let machines = self
            .driver
            .start_management_machines(deadline.remaining())
            .await?;

        match self.install_management(template, &machines, deadline).await {
            Ok(installs) => {
                info!(%driver, machines = machines.len(), "management tier is up");
                Ok(BootstrapOutcome { machines, installs })
            }
            Err(e) => {
                warn!(%driver, error = %e, "bootstrap failed, stopping management machines");
                self.roll_back().await;
                Err(e)
            }
        }
    }

    async fn install_management(
        &self,
        template: &InstallationDetails,
        machines: &[MachineDetails],
        deadline: Deadline,
    ) -> Result<Vec<InstallReport>> {
        if machines.is_empty() {
            return Err(Error::Config(
                "the driver started no management machines".into(),
            ));
        }
        if let Some(machine) = machines.iter().find(|m| m.agent_running) {
            return Err(Error::Config(format!(
                "{machine} already runs a Cloudify agent"
            )));
        }

        let locator = machines
            .iter()
            .filter_map(|m| m.address(true))
            .collect::<Vec<_>>()
            .join(",");
        let details = machines
            .iter()
            .enumerate()
            .map(|(index, machine)| {
                let mut details = template.for_machine(machine)?;
                // Only the first machine serves the REST gateway and web UI.
                details.no_web_services = index > 0;
                details.locator = Some(locator.clone());
                Ok::<_, Error>(details)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tasks = JoinSet::new();
        for (index, details) in details.iter().cloned().enumerate() {
            let installer = self.installer.clone();
            let budget = deadline.remaining();
            tasks.spawn(async move { (index, installer.install_on_machine(&details, budget).await) });
        }
        let mut installs = Vec::with_capacity(details.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined?;
            installs.push((index, result?));
        }
        installs.sort_by_key(|(index, _)| *index);

        for details in details.iter().filter(|d| !d.no_web_services) {
            let host = details.target_host()?;
            debug!(host, "waiting for the rest gateway");
            if !wait_for_registration(self.membership.as_ref(), host, self.poll_interval, deadline)
                .await
            {
                return Err(cfy_installer::Error::Timeout {
                    phase: Phase::Registration,
                    host: host.to_string(),
                }
                .into());
            }
            info!(host, "rest gateway is available");
        }

        Ok(installs.into_iter().map(|(_, report)| report).collect())
    }

    async fn roll_back(&self) {
        let timeout = self.rollback_timeout;
        match tokio::time::timeout(timeout, self.driver.stop_management_machines(timeout)).await {
            Ok(Ok(())) => info!("management machines stopped after failed bootstrap"),
            Ok(Err(e)) => warn!(error = %e, "failed to stop management machines"),
            Err(_) => warn!(?timeout, "timed out stopping management machines"),
        }
    }

    /// Stop every management machine, then release the driver.
    ///
    /// When stopping fails the error is returned and the driver stays open
    /// for another attempt, unless `force` is set, in which case the driver
    /// is closed regardless.
    pub async fn teardown(&self, timeout: Duration, force: bool) -> Result<()> {
        let driver = self.driver.name();
        if !self
            .driver
            .capabilities()
            .supports(Operation::ManagementMachines)
        {
            return Err(cfy_infra::unsupported(driver, "teardown").into());
        }

        info!(%driver, ?timeout, force, "tearing down management machines");
        let stopped =
            match tokio::time::timeout(timeout, self.driver.stop_management_machines(timeout)).await
            {
                Ok(result) => result,
                Err(_) => Err(cfy_infra::Error::Timeout(format!(
                    "stopping management machines took longer than {timeout:?}"
                ))),
            };

        match stopped {
            Ok(()) => {
                self.driver.close().await;
                info!(%driver, "teardown complete");
                Ok(())
            }
            Err(e) if force => {
                warn!(%driver, error = %e, "teardown failed, closing the driver anyway");
                self.driver.close().await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
