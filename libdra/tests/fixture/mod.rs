//! Shared helpers for the integration tests: an in-memory store with a
//! write log, a scripted mock driver, and object constructors.

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use common::{
    AllocationMode, AllocationResult, ObjectMeta, OwnerReference, PodResourceClaim, PodScheduling,
    PodSchedulingSpec, PodSpec, PodTask, RESOURCE_API_VERSION, ResourceClaim,
    ResourceClaimConsumerReference, ResourceClaimSchedulingStatus, ResourceClaimSpec,
    ResourceClaimStatus, ResourceClass, ResourceKind,
};
use libdra::api::{ResourceStore, StoreError};
use libdra::driver::{ClaimAllocation, DraDriver};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

pub const DRIVER_NAME: &str = "mock-driver";
pub const OTHER_DRIVER_NAME: &str = "other-driver";
pub const CLASS_NAME: &str = "mock-class";
pub const OTHER_CLASS_NAME: &str = "other-class";
pub const OUR_FINALIZER: &str = "mock-driver/deletion-protection";
pub const OTHER_FINALIZER: &str = "other-driver/deletion-protection";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// In-memory store

/// `ResourceStore` over hash maps, with the same status/spec overlay and
/// revision-conditional semantics as the Xline store, plus a log of every
/// write so tests can check the one-object-per-pass discipline.
#[derive(Default)]
pub struct MemStore {
    claims: Mutex<HashMap<String, (ResourceClaim, i64)>>,
    classes: Mutex<HashMap<String, (ResourceClass, i64)>>,
    pods: Mutex<HashMap<String, (PodTask, i64)>>,
    schedulings: Mutex<HashMap<String, (PodScheduling, i64)>>,
    next_revision: AtomicI64,
    writes: Mutex<Vec<String>>,
}

fn key_of(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            next_revision: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn bump(&self) -> i64 {
        self.next_revision.fetch_add(1, Ordering::SeqCst)
    }

    pub fn seed_claim(&self, claim: ResourceClaim) -> i64 {
        let key = key_of(&claim.metadata.namespace, &claim.metadata.name);
        let revision = self.bump();
        self.claims.lock().unwrap().insert(key, (claim, revision));
        revision
    }

    pub fn seed_class(&self, class: ResourceClass) -> i64 {
        let revision = self.bump();
        self.classes
            .lock()
            .unwrap()
            .insert(class.metadata.name.clone(), (class, revision));
        revision
    }

    pub fn seed_pod(&self, pod: PodTask) -> i64 {
        let key = key_of(&pod.metadata.namespace, &pod.metadata.name);
        let revision = self.bump();
        self.pods.lock().unwrap().insert(key, (pod, revision));
        revision
    }

    pub fn seed_scheduling(&self, scheduling: PodScheduling) -> i64 {
        let key = key_of(&scheduling.metadata.namespace, &scheduling.metadata.name);
        let revision = self.bump();
        self.schedulings
            .lock()
            .unwrap()
            .insert(key, (scheduling, revision));
        revision
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<ResourceClaim> {
        self.claims
            .lock()
            .unwrap()
            .get(&key_of(namespace, name))
            .map(|(c, _)| c.clone())
    }

    pub fn scheduling(&self, namespace: &str, name: &str) -> Option<PodScheduling> {
        self.schedulings
            .lock()
            .unwrap()
            .get(&key_of(namespace, name))
            .map(|(s, _)| s.clone())
    }

    /// Drain the write log: one `kind:namespace/name` entry per mutation.
    pub fn take_writes(&self) -> Vec<String> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

#[async_trait]
impl ResourceStore for MemStore {
    async fn get_claim(&self, namespace: &str, name: &str)
    -> Result<Option<(ResourceClaim, i64)>> {
        Ok(self
            .claims
            .lock()
            .unwrap()
            .get(&key_of(namespace, name))
            .cloned())
    }

    async fn list_claims(&self) -> Result<Vec<(ResourceClaim, i64)>> {
        Ok(self.claims.lock().unwrap().values().cloned().collect())
    }

    async fn update_claim(&self, claim: &ResourceClaim, expected_revision: i64) -> Result<i64> {
        let key = key_of(&claim.metadata.namespace, &claim.metadata.name);
        let revision = self.bump();
        let mut claims = self.claims.lock().unwrap();
        let Some((stored, stored_revision)) = claims.get_mut(&key) else {
            return Err(StoreError::Conflict {
                kind: "resourceclaim",
                key,
            }
            .into());
        };
        if *stored_revision != expected_revision {
            return Err(StoreError::Conflict {
                kind: "resourceclaim",
                key,
            }
            .into());
        }
        stored.metadata = claim.metadata.clone();
        stored.spec = claim.spec.clone();
        *stored_revision = revision;
        self.writes.lock().unwrap().push(format!("resourceclaim:{key}"));
        Ok(revision)
    }

    async fn update_claim_status(
        &self,
        claim: &ResourceClaim,
        expected_revision: i64,
    ) -> Result<i64> {
        let key = key_of(&claim.metadata.namespace, &claim.metadata.name);
        let revision = self.bump();
        let mut claims = self.claims.lock().unwrap();
        let Some((stored, stored_revision)) = claims.get_mut(&key) else {
            return Err(StoreError::Conflict {
                kind: "resourceclaim",
                key,
            }
            .into());
        };
        if *stored_revision != expected_revision {
            return Err(StoreError::Conflict {
                kind: "resourceclaim",
                key,
            }
            .into());
        }
        stored.status = claim.status.clone();
        *stored_revision = revision;
        self.writes.lock().unwrap().push(format!("resourceclaim:{key}"));
        Ok(revision)
    }

    async fn get_class(&self, name: &str) -> Result<Option<(ResourceClass, i64)>> {
        Ok(self.classes.lock().unwrap().get(name).cloned())
    }

    async fn list_classes(&self) -> Result<Vec<(ResourceClass, i64)>> {
        Ok(self.classes.lock().unwrap().values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<(PodTask, i64)>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&key_of(namespace, name))
            .cloned())
    }

    async fn list_pods(&self) -> Result<Vec<(PodTask, i64)>> {
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    async fn get_scheduling(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(PodScheduling, i64)>> {
        Ok(self
            .schedulings
            .lock()
            .unwrap()
            .get(&key_of(namespace, name))
            .cloned())
    }

    async fn list_schedulings(&self) -> Result<Vec<(PodScheduling, i64)>> {
        Ok(self.schedulings.lock().unwrap().values().cloned().collect())
    }

    async fn update_scheduling_status(
        &self,
        scheduling: &PodScheduling,
        expected_revision: i64,
    ) -> Result<i64> {
        let key = key_of(&scheduling.metadata.namespace, &scheduling.metadata.name);
        let revision = self.bump();
        let mut schedulings = self.schedulings.lock().unwrap();
        let Some((stored, stored_revision)) = schedulings.get_mut(&key) else {
            return Err(StoreError::Conflict {
                kind: "podscheduling",
                key,
            }
            .into());
        };
        if *stored_revision != expected_revision {
            return Err(StoreError::Conflict {
                kind: "podscheduling",
                key,
            }
            .into());
        }
        stored.status = scheduling.status.clone();
        *stored_revision = revision;
        self.writes
            .lock()
            .unwrap()
            .push(format!("podscheduling:{key}"));
        Ok(revision)
    }
}

// ---------------------------------------------------------------------------
// Mock driver

pub struct AllocateSpec {
    pub selected_node: String,
    pub result: Result<AllocationResult, String>,
}

/// Scripted driver: every expectation is keyed by object name, an
/// unexpected call panics the test.
#[derive(Default)]
pub struct MockDriver {
    class_parameters: HashMap<String, Result<Value, String>>,
    claim_parameters: HashMap<String, Result<Value, String>>,
    allocations: HashMap<String, AllocateSpec>,
    deallocations: HashMap<String, Option<String>>,
    // claim name -> remaining failures before deallocate starts succeeding
    deallocate_failures: Mutex<HashMap<String, u32>>,
    unsuitable: HashMap<String, Vec<String>>,
    unsuitable_error: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_class_parameters(mut self, class_name: &str, result: Result<Value, &str>) -> Self {
        self.class_parameters
            .insert(class_name.to_string(), result.map_err(String::from));
        self
    }

    pub fn expect_claim_parameters(mut self, claim_name: &str, result: Result<Value, &str>) -> Self {
        self.claim_parameters
            .insert(claim_name.to_string(), result.map_err(String::from));
        self
    }

    pub fn expect_allocate(
        mut self,
        claim_name: &str,
        selected_node: &str,
        result: Result<AllocationResult, &str>,
    ) -> Self {
        self.allocations.insert(claim_name.to_string(), AllocateSpec {
            selected_node: selected_node.to_string(),
            result: result.map_err(String::from),
        });
        self
    }

    pub fn expect_deallocate(mut self, claim_name: &str, error: Option<&str>) -> Self {
        self.deallocations
            .insert(claim_name.to_string(), error.map(String::from));
        self
    }

    /// Deallocate fails `failures` times, then succeeds.
    pub fn expect_flaky_deallocate(mut self, claim_name: &str, failures: u32) -> Self {
        self.deallocations.insert(claim_name.to_string(), None);
        self.deallocate_failures
            .lock()
            .unwrap()
            .insert(claim_name.to_string(), failures);
        self
    }

    pub fn expect_unsuitable_nodes(mut self, pod_claim_name: &str, nodes: &[&str]) -> Self {
        self.unsuitable.insert(
            pod_claim_name.to_string(),
            nodes.iter().map(|n| n.to_string()).collect(),
        );
        self
    }

    pub fn expect_unsuitable_nodes_error(mut self, error: &str) -> Self {
        self.unsuitable_error = Some(error.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DraDriver for MockDriver {
    async fn class_parameters(&self, class: &ResourceClass) -> Result<Value> {
        self.record(format!("class_parameters:{}", class.metadata.name));
        match self.class_parameters.get(&class.metadata.name) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(anyhow!("{err}")),
            None => panic!("unexpected class_parameters call for {}", class.metadata.name),
        }
    }

    async fn claim_parameters(
        &self,
        claim: &ResourceClaim,
        _class: &ResourceClass,
        _class_parameters: &Value,
    ) -> Result<Value> {
        self.record(format!("claim_parameters:{}", claim.metadata.name));
        match self.claim_parameters.get(&claim.metadata.name) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(anyhow!("{err}")),
            None => panic!("unexpected claim_parameters call for {}", claim.metadata.name),
        }
    }

    async fn allocate(
        &self,
        claim: &ResourceClaim,
        _claim_parameters: &Value,
        _class: &ResourceClass,
        _class_parameters: &Value,
        selected_node: &str,
    ) -> Result<AllocationResult> {
        self.record(format!("allocate:{}@{selected_node}", claim.metadata.name));
        let Some(spec) = self.allocations.get(&claim.metadata.name) else {
            panic!("unexpected allocate call for {}", claim.metadata.name);
        };
        assert_eq!(spec.selected_node, selected_node, "selected node");
        match &spec.result {
            Ok(allocation) => Ok(allocation.clone()),
            Err(err) => Err(anyhow!("{err}")),
        }
    }

    async fn deallocate(&self, claim: &ResourceClaim) -> Result<()> {
        self.record(format!("deallocate:{}", claim.metadata.name));
        let Some(error) = self.deallocations.get(&claim.metadata.name) else {
            panic!("unexpected deallocate call for {}", claim.metadata.name);
        };
        {
            let mut failures = self.deallocate_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&claim.metadata.name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(anyhow!("fake error"));
            }
        }
        match error {
            Some(err) => Err(anyhow!("{err}")),
            None => Ok(()),
        }
    }

    async fn unsuitable_nodes(
        &self,
        _pod: &PodTask,
        claims: &mut [ClaimAllocation],
        potential_nodes: &[String],
    ) -> Result<()> {
        self.record(format!("unsuitable_nodes:{}", potential_nodes.join(",")));
        if self.unsuitable.is_empty() && self.unsuitable_error.is_none() {
            panic!("unexpected unsuitable_nodes call");
        }
        if let Some(err) = &self.unsuitable_error {
            return Err(anyhow!("{err}"));
        }
        for delayed in claims {
            let Some(nodes) = self.unsuitable.get(&delayed.pod_claim_name) else {
                panic!("unexpected pod claim {}", delayed.pod_claim_name);
            };
            delayed.unsuitable_nodes = nodes.clone();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object constructors

pub fn allocation() -> AllocationResult {
    AllocationResult {
        resource_handle: "handle".to_string(),
        available_on_nodes: Vec::new(),
        shareable: false,
    }
}

pub fn create_class(name: &str, driver_name: &str) -> ResourceClass {
    ResourceClass {
        api_version: RESOURCE_API_VERSION.to_string(),
        kind: "ResourceClass".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            ..Default::default()
        },
        driver_name: driver_name.to_string(),
    }
}

pub fn create_claim(name: &str, namespace: &str, class_name: &str) -> ResourceClaim {
    ResourceClaim {
        api_version: RESOURCE_API_VERSION.to_string(),
        kind: "ResourceClaim".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        },
        spec: ResourceClaimSpec {
            resource_class_name: class_name.to_string(),
            allocation_mode: AllocationMode::Immediate,
        },
        status: ResourceClaimStatus::default(),
    }
}

pub fn delayed(mut claim: ResourceClaim) -> ResourceClaim {
    claim.spec.allocation_mode = AllocationMode::WaitForFirstConsumer;
    claim
}

pub fn with_deletion_timestamp(mut claim: ResourceClaim) -> ResourceClaim {
    claim.metadata.deletion_timestamp = Some("2026-01-01T00:00:00Z".to_string());
    claim
}

pub fn with_finalizer(mut claim: ResourceClaim, finalizer: &str) -> ResourceClaim {
    claim.metadata.finalizers.push(finalizer.to_string());
    claim
}

/// Allocated claims always carry the owned finalizer.
pub fn with_allocate(claim: ResourceClaim) -> ResourceClaim {
    let mut claim = with_finalizer(claim, OUR_FINALIZER);
    claim.status.allocation = Some(allocation());
    claim.status.driver_name = DRIVER_NAME.to_string();
    claim
}

pub fn with_deallocation_requested(mut claim: ResourceClaim) -> ResourceClaim {
    claim.status.deallocation_requested = true;
    claim
}

pub fn with_reserved_for(mut claim: ResourceClaim, pod: &PodTask) -> ResourceClaim {
    claim
        .status
        .reserved_for
        .push(ResourceClaimConsumerReference {
            api_group: String::new(),
            resource: "pods".to_string(),
            name: pod.metadata.name.clone(),
            uid: pod.metadata.uid,
        });
    claim
}

pub fn create_pod(name: &str, namespace: &str, claims: &[(&str, &str)]) -> PodTask {
    PodTask {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Uuid::from_u128(0x1234),
            ..Default::default()
        },
        spec: PodSpec {
            node_name: None,
            resource_claims: claims
                .iter()
                .map(|(pod_claim_name, claim_name)| PodResourceClaim {
                    name: pod_claim_name.to_string(),
                    resource_claim_name: claim_name.to_string(),
                })
                .collect(),
        },
        status: Default::default(),
    }
}

pub fn create_pod_scheduling(pod: &PodTask) -> PodScheduling {
    PodScheduling {
        api_version: RESOURCE_API_VERSION.to_string(),
        kind: "PodScheduling".to_string(),
        metadata: ObjectMeta {
            name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
            owner_references: Some(vec![OwnerReference {
                api_version: pod.api_version.clone(),
                kind: ResourceKind::Pod,
                name: pod.metadata.name.clone(),
                uid: pod.metadata.uid,
                controller: true,
            }]),
            ..Default::default()
        },
        spec: PodSchedulingSpec::default(),
        status: Default::default(),
    }
}

pub fn with_selected_node(mut scheduling: PodScheduling, node: &str) -> PodScheduling {
    scheduling.spec.selected_node = node.to_string();
    scheduling
}

pub fn with_potential_nodes(mut scheduling: PodScheduling, nodes: &[&str]) -> PodScheduling {
    scheduling.spec.potential_nodes = nodes.iter().map(|n| n.to_string()).collect();
    scheduling
}

pub fn with_unsuitable_nodes(
    mut scheduling: PodScheduling,
    pod_claim_name: &str,
    nodes: &[&str],
) -> PodScheduling {
    scheduling
        .status
        .resource_claims
        .push(ResourceClaimSchedulingStatus {
            name: pod_claim_name.to_string(),
            unsuitable_nodes: nodes.iter().map(|n| n.to_string()).collect(),
        });
    scheduling
}
