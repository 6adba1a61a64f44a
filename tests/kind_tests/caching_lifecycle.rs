//! Integration tests for the caching lifecycle
//!
//! Each story starts the controller in-process, applies an ImageCache and
//! watches real Jobs drive its status.

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};

use fledge::controller::jobs::{CACHE_UID_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use fledge::crd::{ImageCache, ImageCachePhase, ItemState, PURGE_ANNOTATION};

use super::helpers::{
    cleanup_cache, ensure_test_cluster, sample_cache, wait_for, RunningController,
    TEST_NAMESPACE,
};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(180);

async fn phase_of(api: &Api<ImageCache>, name: &str) -> Option<ImageCachePhase> {
    api.get(name).await.ok()?.status.map(|s| s.phase)
}

/// Story: A small image is cached on every node
///
/// Expected behavior:
/// - One pull Job per node is created and labelled with the owner's UID
/// - The ImageCache reaches Succeeded with every item Present
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_image_is_cached_on_every_node() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let api = &api;
    let name = "test-cache-pull";
    cleanup_cache(&client, name).await;

    let controller = RunningController::start(client.clone());
    let created = api
        .create(&PostParams::default(), &sample_cache(name, &["busybox:1.36"]))
        .await
        .expect("failed to create image cache");
    let uid = created.metadata.uid.clone().unwrap_or_default();

    let jobs: Api<Job> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let selector = format!(
        "{}={},{}={}",
        MANAGED_BY_LABEL, MANAGED_BY_VALUE, CACHE_UID_LABEL, uid
    );
    let (jobs, selector) = (&jobs, &selector);
    let saw_jobs = wait_for(Duration::from_secs(60), move || async move {
        jobs.list(&ListParams::default().labels(&selector))
            .await
            .map(|l| !l.items.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(saw_jobs, "controller should create pull Jobs");

    let converged = wait_for(CONVERGE_TIMEOUT, move || async move {
        phase_of(api, name).await == Some(ImageCachePhase::Succeeded)
    })
    .await;
    assert!(converged, "image cache should reach Succeeded");

    let status = api
        .get(name)
        .await
        .expect("failed to get image cache")
        .status
        .expect("status should be written");
    assert!(!status.items.is_empty());
    assert!(status.items.iter().all(|i| i.state == ItemState::Present));
    assert!(status.completion_time.is_some());

    cleanup_cache(&client, name).await;
    controller.stop().await;
}

/// Story: A spec with a duplicated image is rejected
///
/// Expected behavior:
/// - The ImageCache goes Failed with reason ValidationFailed
/// - No Jobs are created for it
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_invalid_spec_is_reported() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let api = &api;
    let name = "test-cache-invalid";
    cleanup_cache(&client, name).await;

    let controller = RunningController::start(client.clone());
    api.create(
        &PostParams::default(),
        &sample_cache(name, &["busybox:1.36", "busybox:1.36"]),
    )
    .await
    .expect("failed to create image cache");

    let failed = wait_for(Duration::from_secs(60), move || async move {
        phase_of(api, name).await == Some(ImageCachePhase::Failed)
    })
    .await;
    assert!(failed, "invalid spec should be marked Failed");

    let status = api.get(name).await.unwrap().status.unwrap();
    assert_eq!(status.reason.as_deref(), Some("ValidationFailed"));
    assert!(status
        .message
        .unwrap_or_default()
        .contains("Duplicate image names"));

    cleanup_cache(&client, name).await;
    controller.stop().await;
}

/// Story: The purge annotation empties the cache while the resource stays
///
/// Expected behavior:
/// - After caching converges, annotating triggers purge Jobs
/// - The ImageCache settles again with no Present items left
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_purge_annotation_empties_the_cache() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let api = &api;
    let name = "test-cache-purge";
    cleanup_cache(&client, name).await;

    let controller = RunningController::start(client.clone());
    api.create(&PostParams::default(), &sample_cache(name, &["busybox:1.36"]))
        .await
        .expect("failed to create image cache");
    let cached = wait_for(CONVERGE_TIMEOUT, move || async move {
        phase_of(api, name).await == Some(ImageCachePhase::Succeeded)
    })
    .await;
    assert!(cached, "image cache should reach Succeeded before purging");

    let patch = serde_json::json!({
        "metadata": { "annotations": { PURGE_ANNOTATION: "true" } }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to annotate image cache");

    let purged = wait_for(CONVERGE_TIMEOUT, move || async move {
        match api.get(name).await.ok().and_then(|c| c.status) {
            Some(status) => {
                status.phase.is_terminal()
                    && !status.items.iter().any(|i| i.state == ItemState::Present)
            }
            None => false,
        }
    })
    .await;
    assert!(purged, "every cached image should be purged");

    cleanup_cache(&client, name).await;
    controller.stop().await;
}

/// Story: Deleting the ImageCache removes it once its Jobs are gone
///
/// Expected behavior:
/// - The cleanup finalizer is added by the controller
/// - Deletion completes and no managed Jobs for the resource remain
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deletion_releases_the_resource() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let api = &api;
    let name = "test-cache-delete";
    cleanup_cache(&client, name).await;

    let controller = RunningController::start(client.clone());
    let created = api
        .create(&PostParams::default(), &sample_cache(name, &["busybox:1.36"]))
        .await
        .expect("failed to create image cache");
    let uid = created.metadata.uid.clone().unwrap_or_default();

    let finalized = wait_for(Duration::from_secs(60), move || async move {
        api.get(name)
            .await
            .map(|c| c.metadata.finalizers.map(|f| !f.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    })
    .await;
    assert!(finalized, "controller should add its cleanup finalizer");

    cleanup_cache(&client, name).await;
    let gone = wait_for(Duration::from_secs(60), move || async move {
        matches!(api.get_opt(name).await, Ok(None))
    })
    .await;
    assert!(gone, "deletion should complete");

    let jobs: Api<Job> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let remaining = jobs
        .list(&ListParams::default().labels(&format!("{}={}", CACHE_UID_LABEL, uid)))
        .await
        .expect("failed to list jobs");
    assert!(
        remaining
            .items
            .iter()
            .all(|j| j.metadata.deletion_timestamp.is_some()),
        "no live Jobs should remain for a deleted resource"
    );

    controller.stop().await;
}
