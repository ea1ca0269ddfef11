//! Contract between the controller and the registry it persists progress in.

use anyhow::Result;
use async_trait::async_trait;
use common::{PodScheduling, PodTask, ResourceClaim, ResourceClass};
use thiserror::Error;

/// Failure of a version-conditional write.
///
/// The dispatcher treats a conflict like any other transient error: the key
/// is retried with backoff and the reconciler re-reads the object from the
/// cache once the corresponding watch event has arrived.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: String },
}

/// Read and mutate access to the watched object kinds.
///
/// Reads return the object together with the store revision it was read at.
/// Updates are conditional on that revision and yield the new revision, so a
/// caller can chain a metadata write after a status write on the same object.
/// Status updates and spec/metadata updates are distinct verbs: each one
/// leaves the fields owned by the other verb untouched.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get_claim(&self, namespace: &str, name: &str)
    -> Result<Option<(ResourceClaim, i64)>>;
    async fn list_claims(&self) -> Result<Vec<(ResourceClaim, i64)>>;
    /// Write spec and metadata (finalizers); keeps the stored status.
    async fn update_claim(&self, claim: &ResourceClaim, expected_revision: i64) -> Result<i64>;
    /// Write status; keeps the stored spec and metadata.
    async fn update_claim_status(
        &self,
        claim: &ResourceClaim,
        expected_revision: i64,
    ) -> Result<i64>;

    async fn get_class(&self, name: &str) -> Result<Option<(ResourceClass, i64)>>;
    async fn list_classes(&self) -> Result<Vec<(ResourceClass, i64)>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<(PodTask, i64)>>;
    async fn list_pods(&self) -> Result<Vec<(PodTask, i64)>>;

    async fn get_scheduling(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(PodScheduling, i64)>>;
    async fn list_schedulings(&self) -> Result<Vec<(PodScheduling, i64)>>;
    /// Write status; keeps the stored spec and metadata.
    async fn update_scheduling_status(
        &self,
        scheduling: &PodScheduling,
        expected_revision: i64,
    ) -> Result<i64>;
}
