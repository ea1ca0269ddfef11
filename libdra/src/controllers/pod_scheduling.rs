//! Pod-scheduling reconciler: reports unsuitable nodes to the scheduler and,
//! once a node is selected, allocates the pod's pending claims.

use anyhow::{Result, anyhow, bail};
use common::{
    AllocationMode, RESOURCE_GROUP, ResourceClaimConsumerReference, ResourceClaimSchedulingStatus,
};
use log::{debug, info};
use serde_json::Value;

use crate::controllers::{DraController, ReconcileOutcome};
use crate::driver::ClaimAllocation;

impl DraController {
    pub(crate) async fn sync_scheduling(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome> {
        let Some((scheduling, revision)) = self.cache.get_scheduling(namespace, name).await else {
            debug!("pod scheduling gone from cache key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        };
        if scheduling.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileOutcome::Done);
        }

        // Same name as the pod it coordinates.
        let Some((pod, _)) = self.cache.get_pod(namespace, name).await else {
            bail!("pod \"{namespace}/{name}\" not found");
        };
        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileOutcome::Done);
        }

        // The delayed set: claims of this pod that wait for a consumer, are
        // not yet allocated, and belong to this driver.
        let mut delayed: Vec<ClaimAllocation> = Vec::new();
        for pod_claim in &pod.spec.resource_claims {
            let claim_name = &pod_claim.resource_claim_name;
            let Some((claim, claim_revision)) = self.cache.get_claim(namespace, claim_name).await
            else {
                bail!(
                    "retrieve claim {namespace}/{claim_name}: \
                     resourceclaim.{RESOURCE_GROUP} {claim_name:?} not found"
                );
            };
            if claim.spec.allocation_mode != AllocationMode::WaitForFirstConsumer {
                continue;
            }
            if claim.status.allocation.is_some() {
                continue;
            }
            let class_name = claim.spec.resource_class_name.clone();
            let Some((class, _)) = self.cache.get_class(&class_name).await else {
                bail!(
                    "pod claim {}: resourceclass.{RESOURCE_GROUP} {class_name:?} not found",
                    pod_claim.name
                );
            };
            if class.driver_name != self.driver_name {
                continue;
            }
            delayed.push(ClaimAllocation {
                pod_claim_name: pod_claim.name.clone(),
                claim,
                claim_revision,
                class,
                class_parameters: Value::Null,
                claim_parameters: Value::Null,
                unsuitable_nodes: Vec::new(),
            });
        }

        if delayed.is_empty() {
            // The pod's claim list or the claims themselves may change.
            debug!("no pending claims key={namespace}/{name}");
            return Ok(ReconcileOutcome::Periodic);
        }

        let potential_nodes = scheduling.spec.potential_nodes.clone();
        if potential_nodes.is_empty() {
            // The scheduler has not proposed candidates yet.
            debug!("no potential nodes key={namespace}/{name}");
            return Ok(ReconcileOutcome::Done);
        }

        for entry in &mut delayed {
            entry.class_parameters = self
                .driver
                .class_parameters(&entry.class)
                .await
                .map_err(|e| {
                    anyhow!("pod claim {}: class parameters: {e:#}", entry.pod_claim_name)
                })?;
            entry.claim_parameters = self
                .driver
                .claim_parameters(&entry.claim, &entry.class, &entry.class_parameters)
                .await
                .map_err(|e| {
                    anyhow!("pod claim {}: claim parameters: {e:#}", entry.pod_claim_name)
                })?;
        }

        self.driver
            .unsuitable_nodes(&pod, &mut delayed, &potential_nodes)
            .await
            .map_err(|e| anyhow!("unsuitable nodes: {e:#}"))?;
        // What goes to the scheduler must be a subset of what it offered.
        for entry in &mut delayed {
            entry.unsuitable_nodes.retain(|n| potential_nodes.contains(n));
        }

        // Publish the report, replacing our per-claim entries and leaving
        // entries owned by other drivers alone.
        let mut updated = scheduling.clone();
        let mut modified = false;
        for entry in &delayed {
            match updated
                .status
                .resource_claims
                .iter_mut()
                .find(|s| s.name == entry.pod_claim_name)
            {
                Some(existing) if existing.unsuitable_nodes != entry.unsuitable_nodes => {
                    existing.unsuitable_nodes = entry.unsuitable_nodes.clone();
                    modified = true;
                }
                Some(_) => {}
                None => {
                    updated
                        .status
                        .resource_claims
                        .push(ResourceClaimSchedulingStatus {
                            name: entry.pod_claim_name.clone(),
                            unsuitable_nodes: entry.unsuitable_nodes.clone(),
                        });
                    modified = true;
                }
            }
        }
        if modified {
            self.store
                .update_scheduling_status(&updated, revision)
                .await
                .map_err(|e| anyhow!("update unsuitable nodes: {e:#}"))?;
            info!("published unsuitable nodes key={namespace}/{name}");
            return Ok(ReconcileOutcome::Periodic);
        }

        // With the report in place and a node selected, allocate. One claim
        // advances per pass; allocated claims drop out of the delayed set.
        if !scheduling.spec.selected_node.is_empty()
            && let Some(entry) = delayed.into_iter().next()
        {
            let consumer = ResourceClaimConsumerReference {
                api_group: String::new(),
                resource: "pods".to_string(),
                name: pod.metadata.name.clone(),
                uid: pod.metadata.uid,
            };
            self.allocate_claim(
                entry.claim,
                entry.claim_revision,
                &entry.class,
                Some((entry.class_parameters, entry.claim_parameters)),
                &scheduling.spec.selected_node,
                Some(consumer),
            )
            .await?;
        }
        Ok(ReconcileOutcome::Periodic)
    }
}
