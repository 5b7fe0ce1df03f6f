//! Fakes for the coordinator tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cfy_infra::events::ProvisioningListener;
use cfy_infra::types::{FileTransferMode, MachineDetails, MachineId, RemoteExecutionMode};
use cfy_infra::{Capabilities, ProviderName, ProvisioningDriver};
use cfy_installer::GridMembership;
use cfy_installer::installer::BOOTSTRAP_SCRIPT;
use cfy_installer::registration::MembershipError;
use cfy_installer::remote::{Connector, ExecOutput, RemoteError, RemoteSession, RemoteTarget};

pub struct FakeDriver {
    pub machines: Vec<MachineDetails>,
    pub capabilities: Capabilities,
    pub stop_fails: bool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub closed: AtomicBool,
}

impl FakeDriver {
    /// `count` machines at 10.0.0.N (public) and 192.168.0.N (private).
    pub fn with_machines(count: usize) -> Self {
        let machines = (1..=count)
            .map(|i| MachineDetails {
                machine_id: Some(MachineId(format!("m-{i}"))),
                public_address: Some(format!("10.0.0.{i}")),
                private_address: Some(format!("192.168.0.{i}")),
                remote_username: Some("root".into()),
                remote_password: Some("secret".into()),
                ..Default::default()
            })
            .collect();
        Self {
            machines,
            capabilities: Capabilities::FULL,
            stop_fails: false,
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProvisioningDriver for FakeDriver {
    fn name(&self) -> ProviderName {
        ProviderName::Byon
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn add_listener(&self, _listener: Arc<dyn ProvisioningListener>) {}

    async fn start_management_machines(
        &self,
        _timeout: Duration,
    ) -> cfy_infra::Result<Vec<MachineDetails>> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.machines.clone())
    }

    async fn stop_management_machines(&self, _timeout: Duration) -> cfy_infra::Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.stop_fails {
            return Err(cfy_infra::Error::Provisioning("provider refused".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Accepts every connection. The bootstrap script fails on `failing_host`.
#[derive(Clone, Default)]
pub struct FakeConnector {
    failing_host: Option<String>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeConnector {
    pub fn failing_on(host: &str) -> Self {
        Self {
            failing_host: Some(host.to_string()),
            ..Default::default()
        }
    }

    /// `(host, command)` for every bootstrap script run.
    pub fn bootstrap_commands(&self) -> Vec<(String, String)> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, command)| command.contains(BOOTSTRAP_SCRIPT))
            .cloned()
            .collect()
    }

    fn session(&self, target: &RemoteTarget) -> Box<dyn RemoteSession> {
        Box::new(FakeSession {
            host: target.host.clone(),
            connector: self.clone(),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn probe(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn open_exec(
        &self,
        target: &RemoteTarget,
        _mode: RemoteExecutionMode,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(self.session(target))
    }

    async fn open_transfer(
        &self,
        target: &RemoteTarget,
        _mode: FileTransferMode,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(self.session(target))
    }
}

struct FakeSession {
    host: String,
    connector: FakeConnector,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput, RemoteError> {
        self.connector
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));
        let fails = self.connector.failing_host.as_deref() == Some(self.host.as_str())
            && command.contains(BOOTSTRAP_SCRIPT);
        Ok(ExecOutput {
            exit_status: u32::from(fails),
            output: String::new(),
        })
    }

    async fn upload(
        &mut self,
        _remote_path: &str,
        _contents: &[u8],
        _timeout: Duration,
    ) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Answers every registration query the same way.
pub struct StaticMembership {
    registered: bool,
    queried: Mutex<Vec<String>>,
}

impl StaticMembership {
    pub fn registered(registered: bool) -> Self {
        Self {
            registered,
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl GridMembership for StaticMembership {
    async fn is_agent_registered(&self, host: &str) -> Result<bool, MembershipError> {
        self.queried.lock().unwrap().push(host.to_string());
        Ok(self.registered)
    }
}
