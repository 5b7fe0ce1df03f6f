use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Machine types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    pub guest: GuestConfig,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_destroy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub cpu_kind: String,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    pub private_ip: Option<String>,
    #[serde(default)]
    pub config: Option<MachineConfigView>,
}

impl Machine {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.metadata.get(key))
            .map(String::as_str)
    }
}

/// The parts of a machine's config that come back from the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineConfigView {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// States accepted by the `/wait` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Started,
    Stopped,
    Destroyed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_is_omitted() {
        let req = CreateMachineRequest {
            name: "cloudify-agent-1".into(),
            region: "iad".into(),
            config: MachineConfig {
                image: "ubuntu:22.04".into(),
                env: None,
                guest: GuestConfig {
                    cpus: 1,
                    cpu_kind: "shared".into(),
                    memory_mb: 1024,
                },
                metadata: HashMap::new(),
                auto_destroy: Some(false),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["config"].get("metadata").is_none());
        assert!(json["config"].get("env").is_none());
    }

    #[test]
    fn machine_metadata_lookup() {
        let machine: Machine = serde_json::from_value(serde_json::json!({
            "id": "148e",
            "name": "cloudify-management-1",
            "state": "started",
            "region": "iad",
            "private_ip": "fdaa::3",
            "config": { "metadata": { "cloudify-role": "management" } }
        }))
        .unwrap();
        assert_eq!(machine.metadata("cloudify-role"), Some("management"));

        let bare: Machine = serde_json::from_value(serde_json::json!({
            "id": "1", "name": "n", "state": "stopped", "region": "iad"
        }))
        .unwrap();
        assert!(bare.metadata("cloudify-role").is_none());
    }
}
