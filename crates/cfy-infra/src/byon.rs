use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::context::DriverClassContext;
use crate::credentials::resolve_credentials;
use crate::events::{EventPublisher, ProvisioningListener, names};
use crate::settings::DriverSettings;
use crate::types::{MachineDetails, MachineId};
use crate::{Capabilities, Error, ProviderName, ProvisioningDriver, Result};

const NODE_POOL_KEY: &str = "node-pool";

/// A pre-existing host the BYON driver can hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub address: String,
}

impl Node {
    /// Parse `id@address`, or a bare address used as its own id.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (id, address) = match raw.split_once('@') {
            Some((id, address)) => (id.trim(), address.trim()),
            None => (raw, raw),
        };
        if id.is_empty() || address.is_empty() {
            return Err(Error::InvalidId(raw.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    Agent,
    Management,
}

/// The nodes and who holds them. Shared by every BYON driver instance
/// through the driver class context, so two drivers never hand out the
/// same host.
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    allocated: Mutex<BTreeMap<String, Allocation>>,
}

impl NodePool {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            allocated: Mutex::new(BTreeMap::new()),
        }
    }

    fn allocate(&self, kind: Allocation) -> Option<Node> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let node = self.nodes.iter().find(|n| !allocated.contains_key(&n.id))?;
        allocated.insert(node.id.clone(), kind);
        Some(node.clone())
    }

    fn release(&self, id: &str) -> bool {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        allocated.remove(id).is_some()
    }

    fn release_all(&self, kind: Allocation) -> Vec<String> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = allocated
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            allocated.remove(id);
        }
        ids
    }

    pub fn free(&self) -> usize {
        let allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        self.nodes.len() - allocated.len()
    }
}

/// "Bring your own node" driver: hands out hosts from a fixed list instead
/// of creating VMs.
pub struct ByonDriver {
    pool: Arc<NodePool>,
    settings: DriverSettings,
    events: EventPublisher,
}

impl ByonDriver {
    /// Create from env vars: `BYON_NODES` (required, comma-separated
    /// `id@address` entries).
    pub async fn from_env(settings: DriverSettings, ctx: Arc<DriverClassContext>) -> Result<Self> {
        let raw = std::env::var("BYON_NODES").map_err(|_| Error::MissingEnv("BYON_NODES".into()))?;
        let nodes = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Node::parse)
            .collect::<Result<Vec<_>>>()?;
        Self::with_nodes(nodes, settings, &ctx).await
    }

    pub async fn with_nodes(
        nodes: Vec<Node>,
        settings: DriverSettings,
        ctx: &DriverClassContext,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Provisioning("BYON node list is empty".into()));
        }
        let pool = ctx
            .get_or_create(NODE_POOL_KEY, || async move { Ok(NodePool::new(nodes)) })
            .await?;
        Ok(Self {
            pool,
            settings,
            events: EventPublisher::default(),
        })
    }

    fn machine_for(&self, node: &Node) -> Result<MachineDetails> {
        let machine = MachineDetails {
            machine_id: Some(MachineId(node.id.clone())),
            public_address: Some(node.address.clone()),
            private_address: Some(node.address.clone()),
            ..self.settings.machine_template()
        };
        resolve_credentials(machine, self.settings.key_file.as_deref())
    }

    fn allocate(&self, kind: Allocation) -> Result<MachineDetails> {
        let node = self.pool.allocate(kind).ok_or_else(|| {
            Error::Provisioning("no free nodes left in the BYON node pool".into())
        })?;
        match self.machine_for(&node) {
            Ok(machine) => Ok(machine),
            Err(e) => {
                self.pool.release(&node.id);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ProvisioningDriver for ByonDriver {
    fn name(&self) -> ProviderName {
        ProviderName::Byon
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    fn add_listener(&self, listener: Arc<dyn ProvisioningListener>) {
        self.events.add(listener);
    }

    async fn start_machine(&self, _location_id: Option<&str>, _timeout: Duration) -> Result<MachineDetails> {
        self.events.publish(names::STARTING_MACHINE, &[]);
        let machine = self.allocate(Allocation::Agent).inspect_err(|e| {
            self.events.publish(names::MACHINE_START_FAILED, &[e.to_string()]);
        })?;
        info!(node = %machine, "byon: node allocated");
        self.events
            .publish(names::MACHINE_STARTED, &[machine.to_string()]);
        Ok(machine)
    }

    async fn start_management_machines(&self, _timeout: Duration) -> Result<Vec<MachineDetails>> {
        let count = self.settings.management_machines;
        if self.pool.free() < count {
            return Err(Error::Provisioning(format!(
                "BYON node pool has {} free nodes, {count} management machines requested",
                self.pool.free()
            )));
        }
        crate::management::start_management_machines(
            count,
            &self.events,
            |_| async { self.allocate(Allocation::Management) },
            |id| async move { Ok(self.pool.release(&id.0)) },
        )
        .await
    }

    async fn stop_machine(&self, machine_id: &MachineId, _timeout: Duration) -> Result<bool> {
        let released = self.pool.release(&machine_id.0);
        if released {
            info!(machine_id = %machine_id, "byon: node released");
            self.events
                .publish(names::MACHINE_STOPPED, &[machine_id.to_string()]);
        }
        Ok(released)
    }

    async fn stop_management_machines(&self, _timeout: Duration) -> Result<()> {
        let released = self.pool.release_all(Allocation::Management);
        info!(count = released.len(), "byon: management nodes released");
        Ok(())
    }

    fn compute_context(&self) -> Option<&(dyn std::any::Any + Send + Sync)> {
        Some(self.pool.as_ref())
    }
}
