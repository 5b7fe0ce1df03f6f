use std::sync::Arc;

use crate::events::{EventPublisher, ProvisioningListener};
use crate::{Capabilities, ProviderName, ProvisioningDriver};

/// Driver for the single-host local cloud.
///
/// The local cloud runs management and agent on the current host, so there
/// is nothing to provision: every machine operation is unsupported and the
/// driver says so through [`Capabilities::NONE`].
#[derive(Default)]
pub struct LocalCloudDriver {
    events: EventPublisher,
}

impl LocalCloudDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProvisioningDriver for LocalCloudDriver {
    fn name(&self) -> ProviderName {
        ProviderName::LocalCloud
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn add_listener(&self, listener: Arc<dyn ProvisioningListener>) {
        self.events.add(listener);
    }
}
