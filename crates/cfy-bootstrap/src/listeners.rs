//! Listeners that forward installer, driver and validation progress into
//! `tracing`.

use cfy_infra::events::ProvisioningListener;
use cfy_installer::InstallerListener;
use cfy_installer::validation::{ValidationContext, ValidationMessageType, ValidationResultType};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl InstallerListener for TracingListener {
    fn on_installer_event(&self, event_name: &str, args: &[String]) {
        info!(target: "cfy::installer", event = event_name, ?args);
    }
}

impl ProvisioningListener for TracingListener {
    fn on_provisioning_event(&self, event_name: &str, args: &[String]) {
        info!(target: "cfy::provisioning", event = event_name, ?args);
    }
}

impl ValidationContext for TracingListener {
    fn validation_event(&self, message_type: ValidationMessageType, message: &str) {
        info!(target: "cfy::validation", "{}", message_type.format(message));
    }

    fn validation_ongoing_event(&self, message_type: ValidationMessageType, message: &str) {
        info!(target: "cfy::validation", "{} ...", message_type.format(message));
    }

    fn validation_event_end(&self, result: ValidationResultType) {
        match result {
            ValidationResultType::Ok => info!(target: "cfy::validation", "{result}"),
            _ => warn!(target: "cfy::validation", "{result}"),
        }
    }
}
