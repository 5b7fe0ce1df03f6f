use std::sync::{Arc, RwLock};

/// Event names published by drivers.
pub mod names {
    pub const ATTEMPT_CONNECTION_TO_CLOUD_API: &str = "try_to_connect_to_cloud_api";
    pub const CONNECTION_TO_CLOUD_API_SUCCEEDED: &str = "connection_to_cloud_api_succeeded";
    pub const STARTING_MACHINE: &str = "starting_machine";
    pub const MACHINE_STARTED: &str = "machine_started";
    pub const MACHINE_START_FAILED: &str = "machine_start_failed";
    pub const ATTEMPT_START_MGMT_VMS: &str = "attempting_to_create_management_vms";
    pub const MGMT_VMS_STARTED: &str = "management_started_successfully";
    pub const FAILED_TO_CREATE_MGMT_VM: &str = "failed_to_create_management_vm";
    pub const STOPPING_MACHINE: &str = "stopping_machine";
    pub const MACHINE_STOPPED: &str = "machine_stopped";
}

/// Receives progress events from a provisioning driver.
///
/// `args` are pre-formatted; resolving `event_name` into a human message is
/// up to the listener.
pub trait ProvisioningListener: Send + Sync {
    fn on_provisioning_event(&self, event_name: &str, args: &[String]);
}

/// Fan-out helper drivers embed to publish to their listeners.
#[derive(Default, Clone)]
pub struct EventPublisher {
    listeners: Arc<RwLock<Vec<Arc<dyn ProvisioningListener>>>>,
}

impl EventPublisher {
    pub fn add(&self, listener: Arc<dyn ProvisioningListener>) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    pub fn publish(&self, event_name: &str, args: &[String]) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_provisioning_event(event_name, args);
        }
    }
}
