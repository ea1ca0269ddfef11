//! The reconciliation core: key router, claim reconciler, pod-scheduling
//! reconciler, and the work-queue manager driving them.

mod claim;
mod key;
mod manager;
mod pod_scheduling;

use anyhow::Result;
use common::{PodScheduling, PodTask, ResourceClaim, ResourceClass};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

use crate::api::ResourceStore;
use crate::cache::ObjectCache;
use crate::controllers::key::{ObjectKey, parse_key};
use crate::driver::DraDriver;

/// Outcome of a successful reconciliation attempt.
///
/// `Requeue` and `Periodic` are control flow, not failures: they ask the
/// dispatcher to revisit the key, immediately or after the poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Work finished; the key is dropped.
    Done,
    /// An object the controller does not own could legitimately change;
    /// revisit the key shortly.
    Requeue,
    /// Scheduler-facing state was brought up to date; poll for drift.
    Periodic,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileOutcome::Done => "done",
            ReconcileOutcome::Requeue => "requeue",
            ReconcileOutcome::Periodic => "periodic",
        };
        f.write_str(s)
    }
}

/// Tuning knobs for the work-queue manager.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Parallel reconciliation workers. The queue still guarantees at most
    /// one in-flight reconciliation per key.
    pub workers: usize,
    /// Delay before re-reconciling a key whose outcome was `Periodic`.
    pub poll_interval: Duration,
    /// First retry delay after a failed attempt; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound for the retry delay.
    pub retry_cap: Duration,
    /// Capacity of the key channel.
    pub queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(30),
            retry_base: Duration::from_millis(200),
            retry_cap: Duration::from_secs(30),
            queue_depth: 1000,
        }
    }
}

/// A change observed on one of the watched kinds, fed to
/// [`DraController::handle_event`] by the watch loops (or directly by tests).
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    ClaimApplied(ResourceClaim, i64),
    ClaimDeleted(ResourceClaim),
    ClassApplied(ResourceClass, i64),
    ClassDeleted(ResourceClass),
    PodApplied(PodTask, i64),
    PodDeleted(PodTask),
    SchedulingApplied(PodScheduling, i64),
    SchedulingDeleted(PodScheduling),
}

/// The dynamic resource allocation controller for one driver.
///
/// Reads go through the local [`ObjectCache`]; every mutation is a
/// version-conditional write through the [`ResourceStore`]. A reconciliation
/// pass mutates at most one object and then returns, leaving the follow-up
/// to the watch event the mutation produces.
pub struct DraController {
    driver_name: String,
    finalizer: String,
    driver: Arc<dyn DraDriver>,
    store: Arc<dyn ResourceStore>,
    cache: ObjectCache,
    config: ControllerConfig,

    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    // keys sitting in the channel
    queued: Mutex<HashSet<String>>,
    // keys a worker is reconciling right now
    processing: Mutex<HashSet<String>>,
    // keys that changed while being reconciled
    dirty: Mutex<HashSet<String>>,
    // consecutive failures per key, cleared on success
    attempts: Mutex<HashMap<String, u32>>,
    stop_tx: watch::Sender<bool>,
}

impl DraController {
    /// `driver_name` is the driver identity: it is stamped into
    /// `status.driver_name`, prefixes the deletion-protection finalizer, and
    /// selects which classes this controller serves.
    pub fn new(
        driver_name: impl Into<String>,
        driver: Arc<dyn DraDriver>,
        store: Arc<dyn ResourceStore>,
        config: ControllerConfig,
    ) -> Self {
        let driver_name = driver_name.into();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth);
        let (stop_tx, _) = watch::channel(false);
        Self {
            finalizer: format!("{driver_name}/deletion-protection"),
            driver_name,
            driver,
            store,
            cache: ObjectCache::new(),
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            queued: Mutex::new(HashSet::new()),
            processing: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            stop_tx,
        }
    }

    /// The finalizer token this controller owns:
    /// `<driverName>/deletion-protection`.
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Seed the cache from a store snapshot. The watch loops do this
    /// implicitly; tests and embedders without watches call it directly.
    pub async fn bootstrap(&self) -> Result<()> {
        for (class, revision) in self.store.list_classes().await? {
            self.cache.apply_class(class, revision).await;
        }
        for (claim, revision) in self.store.list_claims().await? {
            self.cache.apply_claim(claim, revision).await;
        }
        for (pod, revision) in self.store.list_pods().await? {
            self.cache.apply_pod(pod, revision).await;
        }
        for (scheduling, revision) in self.store.list_schedulings().await? {
            self.cache.apply_scheduling(scheduling, revision).await;
        }
        Ok(())
    }

    /// Apply one observed change to the cache and enqueue the keys it makes
    /// stale.
    pub async fn handle_event(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::ClaimApplied(claim, revision) => {
                let namespace = claim.metadata.namespace.clone();
                let name = claim.metadata.name.clone();
                self.cache.apply_claim(claim, revision).await;
                self.fan_out_claim(&namespace, &name).await;
            }
            ResourceEvent::ClaimDeleted(claim) => {
                let namespace = &claim.metadata.namespace;
                let name = &claim.metadata.name;
                self.cache.remove_claim(namespace, name).await;
                self.fan_out_claim(namespace, name).await;
            }
            ResourceEvent::ClassApplied(class, revision) => {
                let name = class.metadata.name.clone();
                self.cache.apply_class(class, revision).await;
                self.fan_out_class(&name).await;
            }
            ResourceEvent::ClassDeleted(class) => {
                self.cache.remove_class(&class.metadata.name).await;
                self.fan_out_class(&class.metadata.name).await;
            }
            ResourceEvent::PodApplied(pod, revision) => {
                let has_claims = !pod.spec.resource_claims.is_empty();
                let namespace = pod.metadata.namespace.clone();
                let name = pod.metadata.name.clone();
                self.cache.apply_pod(pod, revision).await;
                if has_claims {
                    self.enqueue(key::scheduling_key(&namespace, &name)).await;
                }
            }
            ResourceEvent::PodDeleted(pod) => {
                let has_claims = !pod.spec.resource_claims.is_empty();
                let namespace = &pod.metadata.namespace;
                let name = &pod.metadata.name;
                self.cache.remove_pod(namespace, name).await;
                if has_claims {
                    self.enqueue(key::scheduling_key(namespace, name)).await;
                }
            }
            ResourceEvent::SchedulingApplied(scheduling, revision) => {
                let namespace = scheduling.metadata.namespace.clone();
                let name = scheduling.metadata.name.clone();
                self.cache.apply_scheduling(scheduling, revision).await;
                self.enqueue(key::scheduling_key(&namespace, &name)).await;
            }
            ResourceEvent::SchedulingDeleted(scheduling) => {
                let namespace = &scheduling.metadata.namespace;
                let name = &scheduling.metadata.name;
                self.cache.remove_scheduling(namespace, name).await;
                self.enqueue(key::scheduling_key(namespace, name)).await;
            }
        }
    }

    // A claim change concerns the claim itself and every pod-scheduling
    // object whose pod references the claim.
    async fn fan_out_claim(&self, namespace: &str, name: &str) {
        self.enqueue(key::claim_key(namespace, name)).await;
        for pod_key in self.cache.pods_for_claim(namespace, name).await {
            self.enqueue(format!("{}:{pod_key}", key::SCHEDULING_KIND))
                .await;
        }
    }

    // A class change concerns every claim referencing the class.
    async fn fan_out_class(&self, name: &str) {
        for claim_key in self.cache.claims_for_class(name).await {
            self.enqueue(format!("{}:{claim_key}", key::CLAIM_KIND)).await;
        }
    }

    /// Reconcile one key against the current cache contents.
    pub async fn sync_key(&self, raw: &str) -> Result<ReconcileOutcome> {
        match parse_key(raw)? {
            ObjectKey::Claim { namespace, name } => self.sync_claim(&namespace, &name).await,
            ObjectKey::Scheduling { namespace, name } => {
                self.sync_scheduling(&namespace, &name).await
            }
        }
    }
}
