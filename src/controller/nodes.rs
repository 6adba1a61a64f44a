//! Node directory and selector resolution
//!
//! Resolution is exact key/value equality over node labels: a node matches
//! when every selector pair is present on it. An empty selector selects every
//! node. Listing failures propagate unchanged; retrying is the control loop's
//! business, not the resolver's.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::render_selector;
use crate::Error;

/// A node as seen by the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name (its identity)
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    /// Create a node with the given labels
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

/// Lists cluster nodes by label selector
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// List nodes carrying every label in `selector` (all nodes when empty)
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>, Error>;
}

/// Node directory backed by the Kubernetes API
pub struct KubeNodeDirectory {
    client: Client,
}

impl KubeNodeDirectory {
    /// Create a directory over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeDirectory for KubeNodeDirectory {
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&render_selector(selector));
        }

        let nodes = api
            .list(&params)
            .await
            .map_err(|e| Error::node_directory(e.to_string()))?;

        Ok(nodes
            .items
            .into_iter()
            .filter_map(|node| {
                let name = node.metadata.name?;
                Some(NodeInfo {
                    name,
                    labels: node.metadata.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}

/// Whether `labels` satisfies every pair in `selector`
pub fn matches_selector(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

/// Resolve a selector to node names, sorted for determinism.
///
/// The directory is trusted to filter, but results are re-checked against
/// the selector so a loose directory implementation cannot widen the set.
pub async fn resolve_nodes(
    directory: &dyn NodeDirectory,
    selector: &BTreeMap<String, String>,
) -> Result<Vec<String>, Error> {
    let nodes = directory.list(selector).await?;
    let mut names: Vec<String> = nodes
        .into_iter()
        .filter(|n| matches_selector(selector, &n.labels))
        .map(|n| n.name)
        .collect();
    names.sort();
    names.dedup();

    debug!(
        selector = %render_selector(selector),
        matched = names.len(),
        "resolved node selector"
    );
    Ok(names)
}
