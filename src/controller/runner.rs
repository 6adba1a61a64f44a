//! Control loop: events in, serialized reconcile passes out
//!
//! Watch streams translate cluster changes into [`ControllerEvent`]s on one
//! channel. The event pump and the resync ticker feed resource keys into the
//! [`WorkQueue`]; a fixed pool of workers drains it, each holding one key at
//! a time.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::controller::jobs::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::controller::queue::WorkQueue;
use crate::controller::reconcile::{mark_exhausted, reconcile, Context, ResourceKey};
use crate::crd::ImageCache;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Floor for the resync period; `tokio::time::interval` rejects zero
const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the event channel between watchers and the pump
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A change that may require reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// An ImageCache was created, updated or deleted
    ResourceChanged(ResourceKey),
    /// A node joined, left, or changed labels
    NodeChanged(String),
    /// A Job owned by this ImageCache changed
    JobChanged(ResourceKey),
}

/// The reconciliation engine: worker pool, event pump and resync ticker
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue<ResourceKey>>,
}

impl Controller {
    /// Create a controller over the given context
    pub fn new(ctx: Arc<Context>) -> Self {
        let queue = Arc::new(WorkQueue::new(ctx.config.reconcile_retry.clone()));
        Self { ctx, queue }
    }

    /// The controller's work queue
    pub fn queue(&self) -> Arc<WorkQueue<ResourceKey>> {
        self.queue.clone()
    }

    /// Run until `shutdown` resolves.
    ///
    /// Workers finish the pass they are in before this returns.
    pub async fn run<S>(self, mut events: mpsc::Receiver<ControllerEvent>, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        info!(workers = self.ctx.config.workers, "starting image cache controller");

        let workers: Vec<_> = (0..self.ctx.config.workers.max(1))
            .map(|id| {
                let ctx = self.ctx.clone();
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        process(&ctx, &queue, &key).await;
                        queue.done(&key);
                    }
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();

        let pump = {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    handle_event(&ctx, &queue, event).await;
                }
                debug!("event channel closed");
            })
        };

        let resync = {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let period = ctx.config.resync_interval.max(MIN_RESYNC_INTERVAL);
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    enqueue_all(&ctx, &queue).await;
                }
            })
        };

        shutdown.await;
        info!("shutting down image cache controller");
        self.queue.shutdown();
        pump.abort();
        resync.abort();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker panicked");
            }
        }
    }
}

async fn enqueue_all(ctx: &Context, queue: &WorkQueue<ResourceKey>) {
    match ctx.store.list().await {
        Ok(keys) => {
            debug!(count = keys.len(), "enqueueing all image caches");
            for key in keys {
                queue.add(key);
            }
        }
        Err(e) => warn!(error = %e, "failed to list image caches"),
    }
}

/// Turn one event into queue adds
pub async fn handle_event(ctx: &Context, queue: &WorkQueue<ResourceKey>, event: ControllerEvent) {
    match event {
        ControllerEvent::ResourceChanged(key) | ControllerEvent::JobChanged(key) => queue.add(key),
        ControllerEvent::NodeChanged(node) => {
            debug!(%node, "node changed, re-resolving every image cache");
            enqueue_all(ctx, queue).await;
        }
    }
}

/// Run one reconcile pass for `key` and decide its next step
pub async fn process(ctx: &Arc<Context>, queue: &WorkQueue<ResourceKey>, key: &ResourceKey) {
    match reconcile(key, ctx.clone()).await {
        Ok(outcome) => {
            queue.forget(key);
            if let Some(delay) = outcome.action.requeue_after() {
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) if e.is_retryable() => {
            if ctx.config.reconcile_retry.is_exhausted(queue.num_requeues(key)) {
                error!(cache = %key, error = %e, "retry budget exhausted, marking failed");
                if let Err(write_err) = mark_exhausted(key, ctx, &e).await {
                    warn!(cache = %key, error = %write_err, "failed to record exhausted retries");
                }
                queue.forget(key);
            } else {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    cache = %key,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "reconcile failed, retrying"
                );
            }
        }
        Err(e) => {
            warn!(cache = %key, error = %e, "reconcile failed permanently");
            queue.forget(key);
        }
    }
}

/// Key of the ImageCache owning a managed Job
pub fn job_owner_key(job: &Job) -> Option<ResourceKey> {
    let namespace = job.namespace()?;
    job.owner_references()
        .iter()
        .find(|o| o.kind == "ImageCache")
        .map(|o| ResourceKey::new(namespace, o.name.clone()))
}

/// Tracks node labels so only membership or label changes become events
#[derive(Debug, Default)]
pub struct NodeLabelTracker {
    known: HashMap<String, BTreeMap<String, String>>,
    initial: Option<HashMap<String, BTreeMap<String, String>>>,
}

impl NodeLabelTracker {
    /// Fold a watch event, returning a node name when an event should fire
    pub fn observe(&mut self, event: Event<Node>) -> Option<String> {
        match event {
            Event::Init => {
                self.initial = Some(HashMap::new());
                None
            }
            Event::InitApply(node) => {
                if let Some(initial) = self.initial.as_mut() {
                    initial.insert(node.name_any(), node.labels().clone());
                }
                None
            }
            Event::InitDone => {
                let fresh = self.initial.take().unwrap_or_default();
                let changed = fresh != self.known;
                let name = fresh
                    .keys()
                    .chain(self.known.keys())
                    .find(|n| fresh.get(*n) != self.known.get(*n))
                    .cloned();
                self.known = fresh;
                if changed {
                    name
                } else {
                    None
                }
            }
            Event::Apply(node) => {
                let name = node.name_any();
                let labels = node.labels().clone();
                if self.known.get(&name) == Some(&labels) {
                    return None;
                }
                self.known.insert(name.clone(), labels);
                Some(name)
            }
            Event::Delete(node) => {
                let name = node.name_any();
                self.known.remove(&name).map(|_| name)
            }
        }
    }
}

/// Build watch futures that feed `events` from the Kubernetes API
pub fn build_watchers(
    client: Client,
    events: mpsc::Sender<ControllerEvent>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let caches: Api<ImageCache> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client);
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    let cache_watch = {
        let tx = events.clone();
        let mut stream = watcher(caches, config.clone())
            .default_backoff()
            .touched_objects()
            .boxed();
        async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(cache) => {
                        let event = ControllerEvent::ResourceChanged(ResourceKey::from_cache(&cache));
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "image cache watch error"),
                }
            }
        }
    };

    let node_watch = {
        let tx = events.clone();
        let mut stream = watcher(nodes, config.clone()).default_backoff().boxed();
        async move {
            let mut tracker = NodeLabelTracker::default();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(event) => {
                        if let Some(node) = tracker.observe(event) {
                            if tx.send(ControllerEvent::NodeChanged(node)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "node watch error"),
                }
            }
        }
    };

    let job_watch = {
        let tx = events;
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let mut stream = watcher(jobs, config.labels(&selector))
            .default_backoff()
            .touched_objects()
            .boxed();
        async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(job) => {
                        if let Some(key) = job_owner_key(&job) {
                            if tx.send(ControllerEvent::JobChanged(key)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "job watch error"),
                }
            }
        }
    };

    info!("- ImageCache watcher");
    info!("- Node watcher");
    info!("- Job watcher");

    vec![Box::pin(cache_watch), Box::pin(node_watch), Box::pin(job_watch)]
}
