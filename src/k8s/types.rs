//! Wire types for the subset of the orchestrator API this crate talks to.
//! Field names follow the upstream Kubernetes REST API's JSON casing;
//! structure follows `node`/`pod`/`podList`/`watchEvent` in `collector.go`.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default, rename = "containerID")]
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerRef>,
    #[serde(default, rename = "initContainers")]
    pub init_containers: Vec<ContainerRef>,
    #[serde(default, rename = "nodeName")]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default, rename = "containerStatuses")]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(default, rename = "initContainerStatuses")]
    pub init_container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Find the status of a regular container by name. "Running" here means
    /// present with a non-empty container ID — matches `findContainerStatus`
    /// in `collector.go`.
    pub fn find_container_status(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|cs| cs.name == name)
    }

    pub fn find_init_container_status(&self, name: &str) -> Option<&ContainerStatus> {
        self.init_container_statuses.iter().find(|cs| cs.name == name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
    pub metadata: ListMeta,
}

/// One line of the NDJSON-framed watch stream. `object` is left as raw JSON
/// since its shape depends on `event_type` (a `Pod` for `ADDED`/`MODIFIED`/
/// `DELETED`, a `Status` carrying an HTTP code for `ERROR`).
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: serde_json::Value,
}

/// The `Status` object Kubernetes sends as the payload of an `ERROR` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: u16,
}
