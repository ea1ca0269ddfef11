//! Work-queue manager: dedupe, per-key single-flight, backoff, and the
//! registry watch loops feeding the queue.

use anyhow::{Result, anyhow};
use common::{PodScheduling, PodTask, ResourceClaim, ResourceClass};
use etcd_client::EventType;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::api::XlineStore;
use crate::controllers::{DraController, ReconcileOutcome, ResourceEvent};

impl DraController {
    /// Queue a key for reconciliation. A key already waiting in the channel
    /// is not queued twice; a key currently being reconciled is marked dirty
    /// and re-queued once its worker finishes.
    pub(crate) async fn enqueue(&self, key: String) {
        {
            let processing = self.processing.lock().await;
            if processing.contains(&key) {
                self.dirty.lock().await.insert(key);
                return;
            }
        }
        let fresh = self.queued.lock().await.insert(key.clone());
        if fresh {
            let _ = self.queue_tx.send(key).await;
        }
    }

    /// Run the dispatcher until [`shutdown`](Self::shutdown): pull keys,
    /// reconcile them on up to `workers` parallel tasks, and re-queue
    /// according to the outcome. Returns after in-flight workers drained.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("controller dispatcher already running"))?;
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut stop_rx = self.stop_tx.subscribe();

        info!("dispatcher started workers={}", self.config.workers);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                next = rx.recv() => {
                    let Some(key) = next else { break };
                    let permit = semaphore.clone().acquire_owned().await?;
                    let ctrl = self.clone();
                    tokio::spawn(async move {
                        ctrl.process_key(key).await;
                        drop(permit);
                    });
                }
            }
        }

        // Drain: wait until every worker slot is free again.
        let _ = semaphore.acquire_many(self.config.workers as u32).await?;
        info!("dispatcher stopped");
        Ok(())
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Stop the dispatcher. Idempotent; watch loops keep running but their
    /// events are no longer dispatched.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn process_key(self: &Arc<Self>, key: String) {
        self.queued.lock().await.remove(&key);
        self.processing.lock().await.insert(key.clone());
        self.dirty.lock().await.remove(&key);

        match self.sync_key(&key).await {
            Ok(outcome) => {
                debug!("reconciled key={key} outcome={outcome}");
                match outcome {
                    ReconcileOutcome::Done => {
                        self.attempts.lock().await.remove(&key);
                    }
                    ReconcileOutcome::Requeue => {
                        // not a failure, but don't spin on a key nobody owns
                        self.requeue_after(key.clone(), self.config.retry_base);
                    }
                    ReconcileOutcome::Periodic => {
                        self.attempts.lock().await.remove(&key);
                        self.requeue_after(key.clone(), self.config.poll_interval);
                    }
                }
            }
            Err(err) => {
                let attempt = {
                    let mut attempts = self.attempts.lock().await;
                    let count = attempts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = retry_delay(self.config.retry_base, self.config.retry_cap, attempt);
                warn!(
                    "reconcile failed key={key} attempt={attempt} backoff_ms={} err={err:#}",
                    delay.as_millis()
                );
                self.requeue_after(key.clone(), delay);
            }
        }

        self.processing.lock().await.remove(&key);
        let was_dirty = self.dirty.lock().await.remove(&key);
        if was_dirty {
            self.attempts.lock().await.remove(&key);
            self.enqueue(key).await;
        }
    }

    fn requeue_after(self: &Arc<Self>, key: String, delay: Duration) {
        let ctrl = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            ctrl.enqueue(key).await;
        });
    }

    /// Spawn the four registry watch loops. Each loop snapshots its kind,
    /// replays the snapshot through [`handle_event`](Self::handle_event),
    /// then follows the watch stream, reconnecting with backoff.
    pub fn start_watch(self: &Arc<Self>, store: Arc<XlineStore>) {
        spawn_watch::<ResourceClaim>(
            self.clone(),
            store.clone(),
            XlineStore::claim_prefix(),
            ResourceEvent::ClaimApplied,
            ResourceEvent::ClaimDeleted,
        );
        spawn_watch::<ResourceClass>(
            self.clone(),
            store.clone(),
            XlineStore::class_prefix(),
            ResourceEvent::ClassApplied,
            ResourceEvent::ClassDeleted,
        );
        spawn_watch::<PodTask>(
            self.clone(),
            store.clone(),
            XlineStore::pod_prefix(),
            ResourceEvent::PodApplied,
            ResourceEvent::PodDeleted,
        );
        spawn_watch::<PodScheduling>(
            self.clone(),
            store,
            XlineStore::scheduling_prefix(),
            ResourceEvent::SchedulingApplied,
            ResourceEvent::SchedulingDeleted,
        );
    }
}

fn retry_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(cap)
}

fn spawn_watch<T>(
    controller: Arc<DraController>,
    store: Arc<XlineStore>,
    prefix: &'static str,
    applied: fn(T, i64) -> ResourceEvent,
    deleted: fn(T) -> ResourceEvent,
) where
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff_ms = 100u64;
        loop {
            match store.snapshot_with_rev::<T>(prefix).await {
                Ok((items, revision)) => {
                    for (object, object_revision) in items {
                        controller.handle_event(applied(object, object_revision)).await;
                    }
                    // rev+1 so snapshot items are not replayed as events
                    match store.watch_prefix(prefix, revision + 1).await {
                        Ok((_watcher, mut stream)) => {
                            backoff_ms = 100;
                            loop {
                                match stream.message().await {
                                    Ok(Some(resp)) => {
                                        for event in resp.events() {
                                            dispatch_watch_event(
                                                &controller, prefix, event, applied, deleted,
                                            )
                                            .await;
                                        }
                                    }
                                    Ok(None) => {
                                        info!("watch closed prefix={prefix}, will reconnect");
                                        break;
                                    }
                                    Err(err) => {
                                        error!(
                                            "watch error prefix={prefix} err={err:?}, will reconnect"
                                        );
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            error!("failed to start watch prefix={prefix} err={err:?}");
                        }
                    }
                }
                Err(err) => {
                    error!("failed to snapshot prefix={prefix} err={err:?}");
                }
            }
            sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(30_000);
        }
    });
}

async fn dispatch_watch_event<T>(
    controller: &DraController,
    prefix: &'static str,
    event: &etcd_client::Event,
    applied: fn(T, i64) -> ResourceEvent,
    deleted: fn(T) -> ResourceEvent,
) where
    T: DeserializeOwned,
{
    match event.event_type() {
        EventType::Put => {
            let Some(kv) = event.kv() else { return };
            let yaml = String::from_utf8_lossy(kv.value());
            match serde_yaml::from_str::<T>(&yaml) {
                Ok(object) => {
                    controller
                        .handle_event(applied(object, kv.mod_revision()))
                        .await;
                }
                Err(err) => warn!("undecodable object prefix={prefix} err={err}"),
            }
        }
        EventType::Delete => {
            let Some(prev) = event.prev_kv() else {
                warn!("delete event missing prev_kv prefix={prefix}");
                return;
            };
            let yaml = String::from_utf8_lossy(prev.value());
            match serde_yaml::from_str::<T>(&yaml) {
                Ok(object) => controller.handle_event(deleted(object)).await,
                Err(err) => warn!("undecodable deleted object prefix={prefix} err={err}"),
            }
        }
    }
}
