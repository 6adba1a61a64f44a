//! Shared helpers for cluster-backed stories

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use fledge::config::ControllerConfig;
use fledge::controller::{build_watchers, Context, Controller, EVENT_CHANNEL_CAPACITY};
use fledge::crd::{CacheSpecEntry, ImageCache, ImageCacheSpec};

/// Namespace every story runs in
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the current cluster and make sure the CRD is installed
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("failed to create client: {}", e))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        "imagecaches.fledge.dev",
        &PatchParams::apply("fledge-integration-test").force(),
        &Patch::Apply(&ImageCache::crd()),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {}", e))?;

    // Give the API server a moment to serve the new resource
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

/// An ImageCache with one entry caching `images` on every node
pub fn sample_cache(name: &str, images: &[&str]) -> ImageCache {
    ImageCache {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: ImageCacheSpec {
            cache_spec: vec![CacheSpecEntry {
                images: images.iter().map(|s| s.to_string()).collect(),
                node_selector: Default::default(),
            }],
        },
        status: None,
    }
}

/// Delete an ImageCache, ignoring "not found"
pub async fn cleanup_cache(client: &Client, name: &str) {
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// A controller running in-process against the test cluster
pub struct RunningController {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    watchers: Vec<JoinHandle<()>>,
}

impl RunningController {
    /// Start the controller with fast polling
    pub fn start(client: Client) -> Self {
        let config = ControllerConfig {
            job_poll_interval: Duration::from_secs(2),
            ..Default::default()
        };
        let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watchers = build_watchers(client, tx)
            .into_iter()
            .map(tokio::spawn)
            .collect();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(Controller::new(ctx).run(rx, async move {
            let _ = stopped.await;
        }));
        Self {
            stop: Some(stop),
            handle,
            watchers,
        }
    }

    /// Stop the controller and its watchers
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

/// Poll `check` every second until it returns true or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}
