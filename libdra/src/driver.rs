//! Driver adapter: the narrow boundary between the controller engine and a
//! concrete resource driver.

use anyhow::Result;
use async_trait::async_trait;
use common::{AllocationResult, PodTask, ResourceClaim, ResourceClass};

/// Opaque parameter payload produced by the driver and handed back to it
/// unchanged. The controller never inspects the value.
pub type DriverParameters = serde_json::Value;

/// The five operations a resource driver provides.
///
/// All calls may block for as long as the driver needs; the controller runs
/// them inside worker tasks that are dropped on shutdown, so a driver should
/// make its futures cancellation-safe.
#[async_trait]
pub trait DraDriver: Send + Sync + 'static {
    /// Fetch and validate the parameters referenced by a class.
    async fn class_parameters(&self, class: &ResourceClass) -> Result<DriverParameters>;

    /// Fetch and validate the parameters referenced by a claim.
    async fn claim_parameters(
        &self,
        claim: &ResourceClaim,
        class: &ResourceClass,
        class_parameters: &DriverParameters,
    ) -> Result<DriverParameters>;

    /// Reserve a resource instance for the claim. `selected_node` is empty
    /// for immediate allocation and names the scheduler's choice otherwise.
    async fn allocate(
        &self,
        claim: &ResourceClaim,
        claim_parameters: &DriverParameters,
        class: &ResourceClass,
        class_parameters: &DriverParameters,
        selected_node: &str,
    ) -> Result<AllocationResult>;

    /// Release whatever the driver holds for the claim. Must handle both a
    /// completed allocation and an allocation that is still in flight; called
    /// repeatedly until it succeeds.
    async fn deallocate(&self, claim: &ResourceClaim) -> Result<()>;

    /// For each pending claim of the pod, record in
    /// [`ClaimAllocation::unsuitable_nodes`] which of `potential_nodes` the
    /// driver cannot serve. Invoked on every reconciliation; must be free of
    /// external side effects.
    async fn unsuitable_nodes(
        &self,
        pod: &PodTask,
        claims: &mut [ClaimAllocation],
        potential_nodes: &[String],
    ) -> Result<()>;
}

/// One delayed-allocation claim of a pod, bundled with everything the driver
/// needs to judge or allocate it.
#[derive(Debug, Clone)]
pub struct ClaimAllocation {
    /// The pod-local name under which the pod references the claim.
    pub pod_claim_name: String,
    pub claim: ResourceClaim,
    /// Store revision of `claim`, used for the conditional status write.
    pub claim_revision: i64,
    pub class: ResourceClass,
    pub class_parameters: DriverParameters,
    pub claim_parameters: DriverParameters,
    /// Filled by [`DraDriver::unsuitable_nodes`].
    pub unsuitable_nodes: Vec<String>,
}
