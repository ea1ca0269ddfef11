//! Local cache of the watched object kinds.
//!
//! The reconcilers only ever read from here; the cache is fed by watch
//! events (and an initial snapshot) in the order the registry emitted them.
//! That is causally consistent but weaker than read-your-writes: after a
//! mutation the reconciler returns and waits for the corresponding event
//! instead of re-reading.

use common::{PodScheduling, PodTask, ResourceClaim, ResourceClass};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Cached objects keyed by `namespace/name` (classes by bare name), each
/// with the store revision it was observed at, plus the reverse indexes the
/// event triggers need.
#[derive(Default)]
pub struct ObjectCache {
    claims: RwLock<HashMap<String, (ResourceClaim, i64)>>,
    classes: RwLock<HashMap<String, (ResourceClass, i64)>>,
    pods: RwLock<HashMap<String, (PodTask, i64)>>,
    schedulings: RwLock<HashMap<String, (PodScheduling, i64)>>,
    // class name -> claim keys referencing it
    claims_by_class: RwLock<HashMap<String, HashSet<String>>>,
    // namespace/claimName -> pod keys referencing it
    pods_by_claim: RwLock<HashMap<String, HashSet<String>>>,
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_claim(&self, namespace: &str, name: &str) -> Option<(ResourceClaim, i64)> {
        self.claims
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
    }

    pub async fn get_class(&self, name: &str) -> Option<(ResourceClass, i64)> {
        self.classes.read().await.get(name).cloned()
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Option<(PodTask, i64)> {
        self.pods
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
    }

    pub async fn get_scheduling(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<(PodScheduling, i64)> {
        self.schedulings
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
    }

    /// Claim keys (`namespace/name`) referencing the class.
    pub async fn claims_for_class(&self, class_name: &str) -> Vec<String> {
        self.claims_by_class
            .read()
            .await
            .get(class_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pod keys (`namespace/name`) referencing the claim.
    pub async fn pods_for_claim(&self, namespace: &str, claim_name: &str) -> Vec<String> {
        self.pods_by_claim
            .read()
            .await
            .get(&object_key(namespace, claim_name))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn apply_claim(&self, claim: ResourceClaim, revision: i64) {
        let key = object_key(&claim.metadata.namespace, &claim.metadata.name);
        let mut claims = self.claims.write().await;
        let mut by_class = self.claims_by_class.write().await;
        if let Some((previous, _)) = claims.get(&key) {
            unindex(&mut by_class, &previous.spec.resource_class_name, &key);
        }
        by_class
            .entry(claim.spec.resource_class_name.clone())
            .or_default()
            .insert(key.clone());
        claims.insert(key, (claim, revision));
    }

    pub async fn remove_claim(&self, namespace: &str, name: &str) {
        let key = object_key(namespace, name);
        let mut claims = self.claims.write().await;
        if let Some((previous, _)) = claims.remove(&key) {
            let mut by_class = self.claims_by_class.write().await;
            unindex(&mut by_class, &previous.spec.resource_class_name, &key);
        }
    }

    pub async fn apply_class(&self, class: ResourceClass, revision: i64) {
        self.classes
            .write()
            .await
            .insert(class.metadata.name.clone(), (class, revision));
    }

    pub async fn remove_class(&self, name: &str) {
        self.classes.write().await.remove(name);
    }

    pub async fn apply_pod(&self, pod: PodTask, revision: i64) {
        let key = object_key(&pod.metadata.namespace, &pod.metadata.name);
        let mut pods = self.pods.write().await;
        let mut by_claim = self.pods_by_claim.write().await;
        if let Some((previous, _)) = pods.get(&key) {
            for claim_key in pod_claim_keys(previous) {
                unindex(&mut by_claim, &claim_key, &key);
            }
        }
        for claim_key in pod_claim_keys(&pod) {
            by_claim.entry(claim_key).or_default().insert(key.clone());
        }
        pods.insert(key, (pod, revision));
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        let key = object_key(namespace, name);
        let mut pods = self.pods.write().await;
        if let Some((previous, _)) = pods.remove(&key) {
            let mut by_claim = self.pods_by_claim.write().await;
            for claim_key in pod_claim_keys(&previous) {
                unindex(&mut by_claim, &claim_key, &key);
            }
        }
    }

    pub async fn apply_scheduling(&self, scheduling: PodScheduling, revision: i64) {
        let key = object_key(&scheduling.metadata.namespace, &scheduling.metadata.name);
        self.schedulings
            .write()
            .await
            .insert(key, (scheduling, revision));
    }

    pub async fn remove_scheduling(&self, namespace: &str, name: &str) {
        self.schedulings
            .write()
            .await
            .remove(&object_key(namespace, name));
    }
}

fn pod_claim_keys(pod: &PodTask) -> Vec<String> {
    pod.spec
        .resource_claims
        .iter()
        .map(|pc| object_key(&pod.metadata.namespace, &pc.resource_claim_name))
        .collect()
}

fn unindex(index: &mut HashMap<String, HashSet<String>>, slot: &str, member: &str) {
    if let Some(set) = index.get_mut(slot) {
        set.remove(member);
        if set.is_empty() {
            index.remove(slot);
        }
    }
}
