//! Claim reconciler: drives a single claim through its allocation lifecycle.

use anyhow::{Result, anyhow, bail};
use common::{
    AllocationMode, RESOURCE_GROUP, ResourceClaim, ResourceClaimConsumerReference, ResourceClass,
};
use log::{debug, info};

use crate::controllers::{DraController, ReconcileOutcome};
use crate::driver::DriverParameters;

impl DraController {
    pub(crate) async fn sync_claim(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some((claim, revision)) = self.cache.get_claim(namespace, name).await else {
            debug!("claim gone from cache key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        };

        if claim.being_deleted() || claim.status.deallocation_requested {
            return self.teardown_claim(claim, revision).await;
        }

        if claim.status.allocation.is_some() {
            debug!("claim already allocated key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        }

        let class_name = claim.spec.resource_class_name.clone();
        let Some((class, _)) = self.cache.get_class(&class_name).await else {
            bail!("resourceclass.{RESOURCE_GROUP} {class_name:?} not found");
        };
        if class.driver_name != self.driver_name {
            // Not ours today, but the class could be repointed at us.
            debug!(
                "claim served by other driver key={namespace}/{name} driver={}",
                class.driver_name
            );
            return Ok(ReconcileOutcome::Requeue);
        }

        if claim.spec.allocation_mode != AllocationMode::Immediate {
            debug!("claim waits for first consumer key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        }

        self.allocate_claim(claim, revision, &class, None, "", None)
            .await
    }

    /// Release driver-side state for a claim that is being deleted or asked
    /// to deallocate. Everything here is keyed off the owned finalizer: its
    /// presence is what marks the claim as ours, the class is not consulted.
    async fn teardown_claim(
        &self,
        mut claim: ResourceClaim,
        revision: i64,
    ) -> Result<ReconcileOutcome> {
        let namespace = claim.metadata.namespace.clone();
        let name = claim.metadata.name.clone();
        if !claim.has_finalizer(&self.finalizer) {
            debug!("terminating claim is not ours key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        }

        let mut revision = revision;
        if claim.status.allocation.is_some() {
            self.driver
                .deallocate(&claim)
                .await
                .map_err(|e| anyhow!("deallocate: {e:#}"))?;
            claim.status.allocation = None;
            claim.status.driver_name = String::new();
            claim.status.deallocation_requested = false;
            revision = self
                .store
                .update_claim_status(&claim, revision)
                .await
                .map_err(|e| anyhow!("remove allocation: {e:#}"))?;
            info!("deallocated claim key={namespace}/{name}");
        } else {
            // The driver may still hold an allocation in flight.
            self.driver
                .deallocate(&claim)
                .await
                .map_err(|e| anyhow!("stop allocation: {e:#}"))?;
            if claim.status.deallocation_requested {
                claim.status.deallocation_requested = false;
                revision = self
                    .store
                    .update_claim_status(&claim, revision)
                    .await
                    .map_err(|e| anyhow!("remove allocation: {e:#}"))?;
            }
        }

        if claim.being_deleted() {
            claim.metadata.finalizers.retain(|f| f != &self.finalizer);
            self.store
                .update_claim(&claim, revision)
                .await
                .map_err(|e| anyhow!("remove finalizer: {e:#}"))?;
            info!("removed finalizer key={namespace}/{name}");
        }
        Ok(ReconcileOutcome::Done)
    }

    /// One step of the allocation path. The finalizer write and the
    /// allocation write are separate passes: the first pass only pins the
    /// claim and returns, the watch event it produces triggers the second.
    pub(crate) async fn allocate_claim(
        &self,
        mut claim: ResourceClaim,
        revision: i64,
        class: &ResourceClass,
        parameters: Option<(DriverParameters, DriverParameters)>,
        selected_node: &str,
        reserve_for: Option<ResourceClaimConsumerReference>,
    ) -> Result<ReconcileOutcome> {
        let namespace = claim.metadata.namespace.clone();
        let name = claim.metadata.name.clone();

        if !claim.has_finalizer(&self.finalizer) {
            claim.metadata.finalizers.push(self.finalizer.clone());
            self.store
                .update_claim(&claim, revision)
                .await
                .map_err(|e| anyhow!("add finalizer: {e:#}"))?;
            info!("added finalizer key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        }

        let (class_parameters, claim_parameters) = match parameters {
            Some(parameters) => parameters,
            None => {
                let class_parameters = self
                    .driver
                    .class_parameters(class)
                    .await
                    .map_err(|e| anyhow!("class parameters: {e:#}"))?;
                let claim_parameters = self
                    .driver
                    .claim_parameters(&claim, class, &class_parameters)
                    .await
                    .map_err(|e| anyhow!("claim parameters: {e:#}"))?;
                (class_parameters, claim_parameters)
            }
        };

        let allocation = self
            .driver
            .allocate(
                &claim,
                &claim_parameters,
                class,
                &class_parameters,
                selected_node,
            )
            .await
            .map_err(|e| anyhow!("allocate: {e:#}"))?;

        claim.status.allocation = Some(allocation);
        claim.status.driver_name = self.driver_name.clone();
        if let Some(consumer) = reserve_for
            && !claim.status.reserved_for.contains(&consumer)
        {
            claim.status.reserved_for.push(consumer);
        }
        self.store
            .update_claim_status(&claim, revision)
            .await
            .map_err(|e| anyhow!("add allocation: {e:#}"))?;
        info!("allocated claim key={namespace}/{name} node={selected_node:?}");
        Ok(ReconcileOutcome::Done)
    }
}
