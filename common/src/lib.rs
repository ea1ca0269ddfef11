use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// API group for the resource allocation kinds.
pub const RESOURCE_GROUP: &str = "resource.rk8s.io";

/// API version stamped on resource allocation objects.
pub const RESOURCE_API_VERSION: &str = "resource.rk8s.io/v1";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(rename = "deletionTimestamp", default)]
    pub deletion_timestamp: Option<String>,
    #[serde(rename = "ownerReferences", default)]
    pub owner_references: Option<Vec<OwnerReference>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: ResourceKind,
    pub name: String,
    pub uid: Uuid,
    #[serde(default)]
    pub controller: bool,
}

/// The resource kinds the allocation controller watches.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ResourceClaim,
    ResourceClass,
    PodScheduling,
    Pod,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ResourceClaim => "resourceclaim",
            ResourceKind::ResourceClass => "resourceclass",
            ResourceKind::PodScheduling => "podscheduling",
            ResourceKind::Pod => "pod",
        };
        f.write_str(s)
    }
}

/// Cluster-scoped template naming the driver that serves claims of this class.
/// Read-only from the controller's perspective.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceClass {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "driverName")]
    pub driver_name: String,
}

/// A namespaced request for one resource instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceClaim {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ResourceClaimSpec,
    #[serde(default)]
    pub status: ResourceClaimStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceClaimSpec {
    #[serde(rename = "resourceClassName")]
    pub resource_class_name: String,
    #[serde(rename = "allocationMode", default)]
    pub allocation_mode: AllocationMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    #[default]
    Immediate,
    WaitForFirstConsumer,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ResourceClaimStatus {
    #[serde(rename = "driverName", default)]
    pub driver_name: String,
    #[serde(default)]
    pub allocation: Option<AllocationResult>,
    #[serde(rename = "reservedFor", default)]
    pub reserved_for: Vec<ResourceClaimConsumerReference>,
    #[serde(rename = "deallocationRequested", default)]
    pub deallocation_requested: bool,
}

/// Result of a successful allocation. Produced by the driver; the controller
/// only stores it and checks for its presence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AllocationResult {
    #[serde(rename = "resourceHandle", default)]
    pub resource_handle: String,
    #[serde(rename = "availableOnNodes", default)]
    pub available_on_nodes: Vec<String>,
    #[serde(default)]
    pub shareable: bool,
}

/// One consumer currently holding an allocated claim.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceClaimConsumerReference {
    #[serde(rename = "apiGroup", default)]
    pub api_group: String,
    pub resource: String,
    pub name: String,
    pub uid: Uuid,
}

/// Per-pod coordination object through which the scheduler and the allocation
/// controller exchange candidate-node information. Same name as the pod.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodScheduling {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSchedulingSpec,
    #[serde(default)]
    pub status: PodSchedulingStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodSchedulingSpec {
    /// Node the scheduler has settled on. Empty until a decision is made.
    #[serde(rename = "selectedNode", default)]
    pub selected_node: String,
    /// Nodes the scheduler is still considering for the pod.
    #[serde(rename = "potentialNodes", default)]
    pub potential_nodes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodSchedulingStatus {
    #[serde(rename = "resourceClaims", default)]
    pub resource_claims: Vec<ResourceClaimSchedulingStatus>,
}

/// Per pod-claim scheduling feedback: nodes the driver cannot serve.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ResourceClaimSchedulingStatus {
    pub name: String,
    #[serde(rename = "unsuitableNodes", default)]
    pub unsuitable_nodes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTask {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodSpec {
    #[serde(rename = "nodeName", default)]
    pub node_name: Option<String>,
    #[serde(rename = "resourceClaims", default)]
    pub resource_claims: Vec<PodResourceClaim>,
}

/// Maps a pod-local claim name to the claim object backing it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodResourceClaim {
    pub name: String,
    #[serde(rename = "resourceClaimName")]
    pub resource_claim_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodStatus {
    #[serde(rename = "podIP", default)]
    pub pod_ip: Option<String>,
}

impl ResourceClaim {
    /// True when the claim carries the given finalizer.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// True when the claim is marked for deletion.
    pub fn being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
