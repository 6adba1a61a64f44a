//! ImageCache specification validation
//!
//! Checks run entry by entry and stop at the first failure:
//! 1. the resource reference must exist
//! 2. each entry lists at least one image
//! 3. images within an entry are distinct
//! 4. the entry's selector lists successfully and, when non-empty, matches
//!    at least one node
//!
//! An empty selector only requires the unrestricted listing to succeed. An
//! empty cluster is not an entry-level error; it simply yields no work.

use std::collections::HashSet;

use tracing::debug;

use crate::controller::nodes::{resolve_nodes, NodeDirectory};
use crate::crd::ImageCache;
use crate::error::ValidationError;

/// Validate an ImageCache against the live node set.
///
/// Read-only: no status is written and no work is scheduled here.
pub async fn validate(
    cache: Option<&ImageCache>,
    directory: &dyn NodeDirectory,
) -> Result<(), ValidationError> {
    let cache = cache.ok_or(ValidationError::Reference)?;

    for entry in &cache.spec.cache_spec {
        if entry.images.is_empty() {
            return Err(ValidationError::EmptyImageList);
        }

        let mut seen = HashSet::with_capacity(entry.images.len());
        for image in &entry.images {
            if !seen.insert(image.as_str()) {
                return Err(ValidationError::DuplicateImage {
                    image: image.clone(),
                });
            }
        }

        let selector = entry.selector_string();
        if entry.node_selector.is_empty() {
            resolve_nodes(directory, &entry.node_selector)
                .await
                .map_err(|e| ValidationError::NodeListAll {
                    message: e.to_string(),
                })?;
        } else {
            let nodes = resolve_nodes(directory, &entry.node_selector)
                .await
                .map_err(|e| ValidationError::NodeList {
                    selector: selector.clone(),
                    message: e.to_string(),
                })?;
            if nodes.is_empty() {
                return Err(ValidationError::NoMatchingNodes { selector });
            }
        }
    }

    debug!(
        entries = cache.spec.cache_spec.len(),
        "image cache specification is valid"
    );
    Ok(())
}
