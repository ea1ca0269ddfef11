//! Xline/etcd-backed [`ResourceStore`].
//!
//! Objects are stored as YAML documents under `/registry/<kind>/...`, the
//! same registry layout the rest of the RK8s control plane uses. Reads
//! surface the key's `mod_revision`; updates run inside a transaction that
//! compares the `mod_revision` against the revision the caller read, so a
//! stale write loses instead of clobbering a concurrent one.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use common::{PodScheduling, PodTask, ResourceClaim, ResourceClass};
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, Txn, TxnOp, WatchOptions, WatchStream, Watcher,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::store::{ResourceStore, StoreError};

const CLAIM_PREFIX: &str = "/registry/resourceclaims/";
const CLASS_PREFIX: &str = "/registry/resourceclasses/";
const POD_PREFIX: &str = "/registry/pods/";
const SCHEDULING_PREFIX: &str = "/registry/podschedulings/";

/// Connection options for the registry.
#[derive(Debug, Clone)]
pub struct XlineOptions {
    pub endpoints: Vec<String>,
}

impl XlineOptions {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

/// Store client backed by an Xline (etcd API) cluster.
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
}

impl XlineStore {
    pub async fn new(options: XlineOptions) -> Result<Self> {
        let client = Client::connect(options.endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    async fn get_raw(&self, key: String) -> Result<Option<(String, i64)>> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| {
            (
                String::from_utf8_lossy(kv.value()).to_string(),
                kv.mod_revision(),
            )
        }))
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, i64)>> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.value()).to_string(),
                    kv.mod_revision(),
                )
            })
            .collect())
    }

    /// Put `value` at `key` if the key is still at `expected_revision`.
    /// Returns the new revision.
    async fn put_if_unchanged(
        &self,
        kind: &'static str,
        key: String,
        value: String,
        expected_revision: i64,
    ) -> Result<i64> {
        let mut client = self.client.write().await;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.as_str(),
                CompareOp::Equal,
                expected_revision,
            )])
            .and_then(vec![TxnOp::put(key.as_str(), value, None)]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::Conflict { kind, key }.into());
        }
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| anyhow!("txn response missing header"))
    }

    async fn get_object<T: DeserializeOwned>(&self, key: String) -> Result<Option<(T, i64)>> {
        match self.get_raw(key).await? {
            Some((yaml, revision)) => Ok(Some((serde_yaml::from_str(&yaml)?, revision))),
            None => Ok(None),
        }
    }

    async fn list_objects<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(T, i64)>> {
        let raw = self.list_raw(prefix).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (yaml, revision) in raw {
            out.push((serde_yaml::from_str(&yaml)?, revision));
        }
        Ok(out)
    }

    /// Read-modify-write of one object: load the current document, let
    /// `merge` overlay the fields the verb owns, CAS-write the result.
    async fn merge_object<T, F>(
        &self,
        kind: &'static str,
        key: String,
        expected_revision: i64,
        merge: F,
    ) -> Result<i64>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut T),
    {
        let Some((yaml, revision)) = self.get_raw(key.clone()).await? else {
            return Err(StoreError::Conflict { kind, key }.into());
        };
        if revision != expected_revision {
            return Err(StoreError::Conflict { kind, key }.into());
        }
        let mut stored: T = serde_yaml::from_str(&yaml)?;
        merge(&mut stored);
        let merged = serde_yaml::to_string(&stored)?;
        self.put_if_unchanged(kind, key, merged, expected_revision)
            .await
    }

    /// List one kind together with the store revision the snapshot was taken
    /// at, for starting a watch right after it.
    pub async fn snapshot_with_rev<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<(Vec<(T, i64)>, i64)> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let mut items = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let yaml = String::from_utf8_lossy(kv.value());
            items.push((serde_yaml::from_str(&yaml)?, kv.mod_revision()));
        }
        Ok((items, revision))
    }

    /// Watch one kind starting at `revision`, with previous values attached
    /// so deletions still carry the deleted object.
    pub async fn watch_prefix(
        &self,
        prefix: &str,
        revision: i64,
    ) -> Result<(Watcher, WatchStream)> {
        let mut client = self.client.write().await;
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision)
            .with_prev_key();
        Ok(client.watch(prefix, Some(options)).await?)
    }

    pub fn claim_prefix() -> &'static str {
        CLAIM_PREFIX
    }

    pub fn class_prefix() -> &'static str {
        CLASS_PREFIX
    }

    pub fn pod_prefix() -> &'static str {
        POD_PREFIX
    }

    pub fn scheduling_prefix() -> &'static str {
        SCHEDULING_PREFIX
    }
}

fn claim_key(namespace: &str, name: &str) -> String {
    format!("{CLAIM_PREFIX}{namespace}/{name}")
}

fn scheduling_key(namespace: &str, name: &str) -> String {
    format!("{SCHEDULING_PREFIX}{namespace}/{name}")
}

#[async_trait]
impl ResourceStore for XlineStore {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(ResourceClaim, i64)>> {
        self.get_object(claim_key(namespace, name)).await
    }

    async fn list_claims(&self) -> Result<Vec<(ResourceClaim, i64)>> {
        self.list_objects(CLAIM_PREFIX).await
    }

    async fn update_claim(&self, claim: &ResourceClaim, expected_revision: i64) -> Result<i64> {
        let key = claim_key(&claim.metadata.namespace, &claim.metadata.name);
        let update = claim.clone();
        self.merge_object::<ResourceClaim, _>(
            "resourceclaim",
            key,
            expected_revision,
            move |stored| {
                stored.metadata = update.metadata;
                stored.spec = update.spec;
            },
        )
        .await
    }

    async fn update_claim_status(
        &self,
        claim: &ResourceClaim,
        expected_revision: i64,
    ) -> Result<i64> {
        let key = claim_key(&claim.metadata.namespace, &claim.metadata.name);
        let status = claim.status.clone();
        self.merge_object::<ResourceClaim, _>(
            "resourceclaim",
            key,
            expected_revision,
            move |stored| {
                stored.status = status;
            },
        )
        .await
    }

    async fn get_class(&self, name: &str) -> Result<Option<(ResourceClass, i64)>> {
        self.get_object(format!("{CLASS_PREFIX}{name}")).await
    }

    async fn list_classes(&self) -> Result<Vec<(ResourceClass, i64)>> {
        self.list_objects(CLASS_PREFIX).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<(PodTask, i64)>> {
        self.get_object(format!("{POD_PREFIX}{namespace}/{name}"))
            .await
    }

    async fn list_pods(&self) -> Result<Vec<(PodTask, i64)>> {
        self.list_objects(POD_PREFIX).await
    }

    async fn get_scheduling(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(PodScheduling, i64)>> {
        self.get_object(scheduling_key(namespace, name)).await
    }

    async fn list_schedulings(&self) -> Result<Vec<(PodScheduling, i64)>> {
        self.list_objects(SCHEDULING_PREFIX).await
    }

    async fn update_scheduling_status(
        &self,
        scheduling: &PodScheduling,
        expected_revision: i64,
    ) -> Result<i64> {
        let key = scheduling_key(&scheduling.metadata.namespace, &scheduling.metadata.name);
        let status = scheduling.status.clone();
        self.merge_object::<PodScheduling, _>(
            "podscheduling",
            key,
            expected_revision,
            move |stored| {
                stored.status = status;
            },
        )
        .await
    }
}
