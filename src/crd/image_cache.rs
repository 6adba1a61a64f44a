//! ImageCache Custom Resource Definition
//!
//! An ImageCache declares which images must be cached on which nodes. Each
//! `cacheSpec` entry pairs an image list with a node selector; the controller
//! pulls the images onto every matching node and purges them once they drop
//! out of the specification.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ImageCachePhase, ImageItemStatus};

/// Annotation that requests every cached image be purged
pub const PURGE_ANNOTATION: &str = "fledge.dev/purge-imagecache";

/// Specification for an ImageCache
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fledge.dev",
    version = "v1alpha1",
    kind = "ImageCache",
    plural = "imagecaches",
    shortname = "ic",
    namespaced,
    status = "ImageCacheStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheSpec {
    /// Image lists and the nodes they should be cached on
    pub cache_spec: Vec<CacheSpecEntry>,
}

/// One clause of an ImageCache: images plus the nodes that should hold them
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpecEntry {
    /// Image references to cache (must be unique within the entry)
    pub images: Vec<String>,

    /// Required node labels; empty means every node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl CacheSpecEntry {
    /// Render the selector as `k=v,k2=v2` (empty string for "all nodes")
    pub fn selector_string(&self) -> String {
        render_selector(&self.node_selector)
    }
}

/// Render a label selector map as a Kubernetes equality selector
pub fn render_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl ImageCache {
    /// Whether the purge-all annotation is set to "true"
    pub fn purge_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PURGE_ANNOTATION))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Status of an ImageCache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheStatus {
    /// Derived summary phase
    #[serde(default)]
    pub phase: ImageCachePhase,

    /// Machine-readable reason for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-(node, image) detail records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ImageItemStatus>,

    /// UIDs of finished Jobs already folded into `items` but not yet deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub settled_jobs: Vec<String>,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the current round of work started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the phase last became terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}
