//! ImageCache reconciliation
//!
//! One pass runs validate → resolve → diff → orchestrate → aggregate for a
//! single resource key and writes the resulting status. Passes are
//! idempotent: every input is re-read, and Jobs already in flight are
//! folded in rather than created again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::controller::diff::{CurrentState, DesiredState};
use crate::controller::jobs::{JobOwner, JobSubstrate, KubeJobSubstrate};
use crate::controller::nodes::{KubeNodeDirectory, NodeDirectory};
use crate::controller::orchestrate::{
    cancel_all, cleanup_finished, observe_jobs, orchestrate,
};
use crate::controller::status::{
    aggregate, exhausted_status, is_permanently_failed, validation_failed_status,
};
use crate::controller::validate::validate;
use crate::crd::{ImageCache, ImageCacheStatus};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Finalizer that holds an ImageCache until its Jobs are cleaned up
pub const CLEANUP_FINALIZER: &str = "fledge.dev/job-cleanup";

/// Field manager used for every write
const FIELD_MANAGER: &str = "fledge-controller";

/// Identity of an ImageCache: namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ResourceKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored ImageCache (`default` when the namespace is unset)
    pub fn from_cache(cache: &ImageCache) -> Self {
        Self::new(
            cache.namespace().unwrap_or_else(|| "default".to_string()),
            cache.name_any(),
        )
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read/write access to ImageCache resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an ImageCache; `None` when it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageCache>, Error>;

    /// Keys of every ImageCache in the cluster
    async fn list(&self) -> Result<Vec<ResourceKey>, Error>;

    /// Replace the status subresource
    async fn patch_status(&self, key: &ResourceKey, status: &ImageCacheStatus) -> Result<(), Error>;

    /// Add a finalizer if not already present
    async fn add_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer if present
    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error>;
}

/// Resource store backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceKey) -> Api<ImageCache> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn patch_finalizers(&self, key: &ResourceKey, finalizers: Vec<String>) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(key)
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Merge patch that replaces the whole status.
///
/// Absent optional fields are sent as explicit nulls so stale values (a
/// completion time from an earlier round, say) are cleared.
pub fn status_patch(status: &ImageCacheStatus) -> Result<serde_json::Value, Error> {
    let mut value =
        serde_json::to_value(status).map_err(|e| Error::serialization(e.to_string()))?;
    if let Some(fields) = value.as_object_mut() {
        for field in [
            "reason",
            "message",
            "observedGeneration",
            "startTime",
            "completionTime",
        ] {
            fields.entry(field).or_insert(serde_json::Value::Null);
        }
        fields.entry("items").or_insert_with(|| json!([]));
        fields.entry("settledJobs").or_insert_with(|| json!([]));
    }
    Ok(json!({ "status": value }))
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageCache>, Error> {
        Ok(self.api(key).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<ResourceKey>, Error> {
        let api: Api<ImageCache> = Api::all(self.client.clone());
        let caches = api.list(&ListParams::default()).await?;
        Ok(caches.items.iter().map(ResourceKey::from_cache).collect())
    }

    async fn patch_status(&self, key: &ResourceKey, status: &ImageCacheStatus) -> Result<(), Error> {
        let patch = status_patch(status)?;
        self.api(key)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error> {
        let cache = self.api(key).get(&key.name).await?;
        let mut finalizers = cache.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(key, finalizers).await
    }

    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error> {
        let cache = match self.api(key).get_opt(&key.name).await? {
            Some(cache) => cache,
            None => return Ok(()),
        };
        let finalizers: Vec<String> = cache
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.patch_finalizers(key, finalizers).await
    }
}

/// Controller context containing shared collaborators and configuration
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// ImageCache store
    pub store: Arc<dyn ResourceStore>,
    /// Node directory
    pub nodes: Arc<dyn NodeDirectory>,
    /// Job execution substrate
    pub jobs: Arc<dyn JobSubstrate>,
    /// Controller tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context with Kubernetes-backed collaborators and default config
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ResourceStore>,
        nodes: Arc<dyn NodeDirectory>,
        jobs: Arc<dyn JobSubstrate>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            jobs,
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ResourceStore>>,
    nodes: Option<Arc<dyn NodeDirectory>>,
    jobs: Option<Arc<dyn JobSubstrate>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            nodes: None,
            jobs: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the node directory
    pub fn node_directory(mut self, nodes: Arc<dyn NodeDirectory>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Override the Job substrate
    pub fn job_substrate(mut self, jobs: Arc<dyn JobSubstrate>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeResourceStore::new(self.client.clone()))),
            nodes: self
                .nodes
                .unwrap_or_else(|| Arc::new(KubeNodeDirectory::new(self.client.clone()))),
            jobs: self
                .jobs
                .unwrap_or_else(|| Arc::new(KubeJobSubstrate::new(self.client.clone()))),
            config: self.config,
        }
    }
}

/// What the control loop should do with a key after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay
    Requeue(Duration),
    /// Wait for the next change notification (or resync)
    AwaitChange,
}

impl Action {
    /// Requeue after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self::Requeue(duration)
    }

    /// Wait for a change
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// The requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(d) => Some(*d),
            Self::AwaitChange => None,
        }
    }
}

/// Result of a successful pass
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileOutcome {
    /// Status written this pass; `None` when the resource is gone or going
    pub status: Option<ImageCacheStatus>,
    /// Follow-up for the control loop
    pub action: Action,
}

impl ReconcileOutcome {
    fn gone() -> Self {
        Self {
            status: None,
            action: Action::await_change(),
        }
    }
}

/// Write status unless the resource was deleted or replaced during the pass
async fn write_status(
    ctx: &Context,
    key: &ResourceKey,
    uid: Option<&str>,
    status: &ImageCacheStatus,
) -> Result<bool, Error> {
    let still_there = match ctx.store.get(key).await? {
        Some(cache) => cache.metadata.deletion_timestamp.is_none() && cache.uid().as_deref() == uid,
        None => false,
    };
    if !still_there {
        debug!("resource deleted during reconcile, skipping status write");
        return Ok(false);
    }

    let config = RetryConfig::exponential(5, Duration::from_millis(200), Duration::from_secs(5));
    retry_with_backoff(&config, "patch_status", || ctx.store.patch_status(key, status)).await?;
    Ok(true)
}

async fn finalize(ctx: &Context, key: &ResourceKey, cache: &ImageCache) -> Result<ReconcileOutcome, Error> {
    let owner = JobOwner::from_cache(cache)?;
    let cancelled = cancel_all(ctx.jobs.as_ref(), &owner.namespace, &owner.uid).await?;
    if cancelled > 0 {
        info!(cancelled, "deleted jobs of deleted image cache");
    }
    if cache.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
        ctx.store.remove_finalizer(key, CLEANUP_FINALIZER).await?;
    }
    Ok(ReconcileOutcome::gone())
}

/// Reconcile one ImageCache
///
/// Writes status as a side effect. Validation failures are written as a
/// Failed status and returned as a non-retryable error; substrate failures
/// hit mid-pass are returned after the partial progress has been written.
#[instrument(skip(ctx), fields(cache = %key))]
pub async fn reconcile(key: &ResourceKey, ctx: Arc<Context>) -> Result<ReconcileOutcome, Error> {
    let cache = match ctx.store.get(key).await? {
        Some(cache) => cache,
        None => {
            debug!("image cache not found");
            return Ok(ReconcileOutcome::gone());
        }
    };
    if cache.metadata.deletion_timestamp.is_some() {
        info!("image cache deleted, cleaning up jobs");
        return finalize(&ctx, key, &cache).await;
    }

    let now = Utc::now();
    let generation = cache.metadata.generation;
    let previous = cache.status.as_ref();
    let uid = cache.uid();

    if is_permanently_failed(previous, generation) {
        debug!("image cache failed permanently at this generation, skipping");
        return Ok(ReconcileOutcome {
            status: previous.cloned(),
            action: Action::await_change(),
        });
    }

    if !cache.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
        ctx.store.add_finalizer(key, CLEANUP_FINALIZER).await?;
    }

    if let Err(e) = validate(Some(&cache), ctx.nodes.as_ref()).await {
        if e.is_transient() {
            return Err(e.into());
        }
        warn!(error = %e, "image cache failed validation");
        let status = validation_failed_status(previous, &e, generation, now);
        write_status(&ctx, key, uid.as_deref(), &status).await?;
        return Err(e.into());
    }

    let live_nodes: BTreeSet<String> = ctx
        .nodes
        .list(&Default::default())
        .await?
        .into_iter()
        .map(|n| n.name)
        .collect();
    let desired = DesiredState::resolve(&cache, ctx.nodes.as_ref()).await?;

    let mut current = CurrentState::from_status(previous.map(|s| s.items.as_slice()).unwrap_or_default());
    if previous.and_then(|s| s.observed_generation) != generation {
        current.reset_terminal_failures(now);
    }

    let owner = JobOwner::from_cache(&cache)?;
    let jobs = ctx.jobs.list(&owner.namespace, &owner.uid).await?;
    let settled: BTreeSet<String> = previous
        .map(|s| s.settled_jobs.iter().cloned().collect())
        .unwrap_or_default();
    let observation = observe_jobs(
        &mut current,
        jobs,
        &live_nodes,
        &settled,
        &ctx.config.job_retry,
        now,
    );
    let mut result = orchestrate(
        ctx.jobs.as_ref(),
        &owner,
        &desired,
        &mut current,
        observation,
        &live_nodes,
        &ctx.config,
        now,
    )
    .await;

    let mut status = aggregate(previous, &desired, &current, &result.pending, generation, now);
    status.settled_jobs = result.finished.iter().map(|job| job.uid.clone()).collect();
    status.settled_jobs.sort();
    if previous.map(|p| &p.phase) != Some(&status.phase) {
        info!(phase = %status.phase, items = status.items.len(), "image cache phase changed");
    }
    if !write_status(&ctx, key, uid.as_deref(), &status).await? {
        return Ok(ReconcileOutcome::gone());
    }

    if let Err(e) = cleanup_finished(ctx.jobs.as_ref(), &owner.namespace, &result.finished).await {
        warn!(error = %e, "failed to delete finished jobs");
        result.errors.push(e);
    }
    if !result.errors.is_empty() {
        let count = result.errors.len();
        let first = result.errors.remove(0);
        warn!(errors = count, "reconcile finished with job errors");
        return Err(first);
    }

    let action = if result.in_flight() || !result.pending.is_empty() {
        Action::requeue(ctx.config.job_poll_interval)
    } else if let Some(at) = current.next_retry_after(now) {
        Action::requeue((at - now).to_std().unwrap_or(ctx.config.job_poll_interval))
    } else {
        Action::await_change()
    };

    Ok(ReconcileOutcome {
        status: Some(status),
        action,
    })
}

/// Mark an ImageCache Failed after its transient retry budget ran out
pub async fn mark_exhausted(key: &ResourceKey, ctx: &Context, err: &Error) -> Result<(), Error> {
    let cache = match ctx.store.get(key).await? {
        Some(cache) if cache.metadata.deletion_timestamp.is_none() => cache,
        _ => return Ok(()),
    };
    let status = exhausted_status(
        cache.status.as_ref(),
        err,
        cache.metadata.generation,
        Utc::now(),
    );
    write_status(ctx, key, cache.uid().as_deref(), &status).await?;
    Ok(())
}
