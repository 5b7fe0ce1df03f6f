use std::fmt;

use serde::{Deserialize, Serialize};

/// A phase of a service's life on its machine, each backed by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    PreServiceStart,
    Init,
    PreInstall,
    Install,
    PostInstall,
    PreStart,
    PostStart,
    PreStop,
    Stop,
    PostStop,
    Shutdown,
    PreServiceStop,
}

impl LifecycleEvent {
    /// Every event, in the order a service goes through them.
    pub const ALL: [Self; 12] = [
        Self::PreServiceStart,
        Self::Init,
        Self::PreInstall,
        Self::Install,
        Self::PostInstall,
        Self::PreStart,
        Self::PostStart,
        Self::PreStop,
        Self::Stop,
        Self::PostStop,
        Self::Shutdown,
        Self::PreServiceStop,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PreServiceStart => "preServiceStart",
            Self::Init => "init",
            Self::PreInstall => "preInstall",
            Self::Install => "install",
            Self::PostInstall => "postInstall",
            Self::PreStart => "preStart",
            Self::PostStart => "postStart",
            Self::PreStop => "preStop",
            Self::Stop => "stop",
            Self::PostStop => "postStop",
            Self::Shutdown => "shutdown",
            Self::PreServiceStop => "preServiceStop",
        }
    }

    /// Conventional script for the event: `<name>.groovy`.
    pub fn script_file_name(&self) -> String {
        format!("{}.groovy", self.name())
    }

    /// The event whose conventional script is exactly `file_name`.
    pub fn from_script_file_name(file_name: &str) -> Option<Self> {
        let name = file_name.strip_suffix(".groovy")?;
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
