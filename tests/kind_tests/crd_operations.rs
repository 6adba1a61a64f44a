//! Integration tests for ImageCache CRD operations
//!
//! These stories cover what the API server itself accepts and persists,
//! without the controller running.

use kube::api::{Api, Patch, PatchParams, PostParams};

use fledge::crd::{ImageCache, PURGE_ANNOTATION};

use super::helpers::{cleanup_cache, ensure_test_cluster, sample_cache, TEST_NAMESPACE};

/// Story: Operator declares the images a node pool should carry
///
/// Expected behavior:
/// - The ImageCache is created and namespaced
/// - Images and selectors round-trip through the API server unchanged
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operator_creates_image_cache() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-crd-create";
    cleanup_cache(&client, name).await;

    let mut cache = sample_cache(name, &["busybox:1.36", "alpine:3.20"]);
    cache.spec.cache_spec[0]
        .node_selector
        .insert("kubernetes.io/os".to_string(), "linux".to_string());
    let created = api
        .create(&PostParams::default(), &cache)
        .await
        .expect("failed to create image cache");
    assert_eq!(created.metadata.namespace.as_deref(), Some(TEST_NAMESPACE));

    let fetched = api.get(name).await.expect("failed to get image cache");
    assert_eq!(fetched.spec, cache.spec);
    assert!(fetched.status.is_none(), "status is written by the controller only");

    cleanup_cache(&client, name).await;
}

/// Story: Operator asks for every cached image to be purged
///
/// Expected behavior:
/// - The purge annotation is stored and recognized
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operator_requests_purge_via_annotation() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<ImageCache> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "test-crd-purge";
    cleanup_cache(&client, name).await;

    api.create(&PostParams::default(), &sample_cache(name, &["busybox:1.36"]))
        .await
        .expect("failed to create image cache");

    let patch = serde_json::json!({
        "metadata": { "annotations": { PURGE_ANNOTATION: "true" } }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to annotate image cache");

    let fetched = api.get(name).await.expect("failed to get image cache");
    assert!(fetched.purge_requested());

    cleanup_cache(&client, name).await;
}
