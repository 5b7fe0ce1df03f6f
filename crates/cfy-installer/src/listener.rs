use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// Event names published while installing on a machine.
pub mod names {
    pub const ATTEMPTING_TO_ACCESS_VM: &str = "attempting_to_access_vm";
    pub const RETRYING_CONNECTION: &str = "retrying_connection";
    pub const UPLOADING_FILES_TO_NODE: &str = "uploading_files_to_node";
    pub const LAUNCHING_AGENT_ON_NODE: &str = "launching_agent_on_node";
    pub const POWERSHELL_OUTPUT_LINE: &str = "powershell_output_line";
    pub const WAITING_FOR_AGENT: &str = "waiting_for_agent_registration";
    pub const INSTALL_COMPLETED_ON_NODE: &str = "install_completed_on_node";
}

/// Progress sink. Implementations must not block.
pub trait InstallerListener: Send + Sync {
    fn on_installer_event(&self, event_name: &str, args: &[String]);
}

/// Fans events out to registered listeners. A panicking listener is logged
/// and skipped.
#[derive(Default, Clone)]
pub struct InstallerEvents {
    listeners: Arc<RwLock<Vec<Arc<dyn InstallerListener>>>>,
}

impl InstallerEvents {
    pub fn add(&self, listener: Arc<dyn InstallerListener>) {
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
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                listener.on_installer_event(event_name, args)
            }));
            if delivered.is_err() {
                warn!(event = event_name, "installer listener panicked, ignoring");
            }
        }
    }
}
