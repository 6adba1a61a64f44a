//! Desired/current state and the diff between them
//!
//! Desired state is recomputed from the specification and the live node set
//! on every pass. Current state is rebuilt from the persisted status items
//! and then updated with live Job outcomes by the orchestrator. The diff is a
//! pure function of both.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::controller::nodes::{resolve_nodes, NodeDirectory};
use crate::crd::{ImageAction, ImageCache, ImageItemStatus, ItemState};
use crate::Error;

/// Images that must be present, per node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    nodes: BTreeMap<String, BTreeSet<String>>,
}

impl DesiredState {
    /// Create an empty desired state
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `image` on `node`
    pub fn insert(&mut self, node: impl Into<String>, image: impl Into<String>) {
        self.nodes
            .entry(node.into())
            .or_default()
            .insert(image.into());
    }

    /// Whether `image` is required on `node`
    pub fn contains(&self, node: &str, image: &str) -> bool {
        self.nodes
            .get(node)
            .map(|images| images.contains(image))
            .unwrap_or(false)
    }

    /// Iterate (node, image) pairs in node then image order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes.iter().flat_map(|(node, images)| {
            images
                .iter()
                .map(move |image| (node.as_str(), image.as_str()))
        })
    }

    /// Number of (node, image) pairs
    pub fn len(&self) -> usize {
        self.nodes.values().map(BTreeSet::len).sum()
    }

    /// Whether nothing is required anywhere
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every entry's selector and union the images per node.
    ///
    /// An ImageCache carrying the purge annotation desires nothing.
    pub async fn resolve(cache: &ImageCache, directory: &dyn NodeDirectory) -> Result<Self, Error> {
        let mut desired = Self::new();
        if cache.purge_requested() {
            return Ok(desired);
        }

        for entry in &cache.spec.cache_spec {
            let nodes = resolve_nodes(directory, &entry.node_selector).await?;
            for node in &nodes {
                for image in &entry.images {
                    desired.insert(node.as_str(), image.as_str());
                }
            }
        }
        Ok(desired)
    }
}

/// Observed state of one (node, image) pair; absence means "absent"
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedState {
    /// A pull Job is running
    Pulling,
    /// The image was pulled
    Present,
    /// A purge Job is running
    Purging,
    /// The last Job for this pair failed
    Failed {
        /// Action the failed Job performed
        action: ImageAction,
        /// Failure detail
        reason: String,
        /// When a retry becomes eligible; `None` once the budget is spent
        retry_at: Option<DateTime<Utc>>,
    },
}

/// One entry of [`CurrentState`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedItem {
    /// Observed state
    pub state: ObservedState,
    /// Failed attempts since the last success or spec change
    pub attempts: u32,
    /// When `state` last changed
    pub last_transition: DateTime<Utc>,
    /// UID of the last Job folded into this entry
    pub job_uid: Option<String>,
}

impl ObservedItem {
    /// A fresh entry in the given state
    pub fn new(state: ObservedState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            attempts: 0,
            last_transition: now,
            job_uid: None,
        }
    }
}

/// Observed per-(node, image) state of one ImageCache
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentState {
    items: BTreeMap<(String, String), ObservedItem>,
}

impl CurrentState {
    /// Create an empty current state
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild current state from persisted status items.
    ///
    /// Pending items carry no observation of their own: a pending pull means
    /// the image is absent, a pending purge means it is still present, and a
    /// pending item with an error is a failure awaiting its retry time.
    pub fn from_status(items: &[ImageItemStatus]) -> Self {
        let mut current = Self::new();
        for item in items {
            let state = match (item.state, item.action) {
                (ItemState::Present, _) => ObservedState::Present,
                (ItemState::Pulling, _) => ObservedState::Pulling,
                (ItemState::Purging, _) => ObservedState::Purging,
                (ItemState::Failed, action) => ObservedState::Failed {
                    action,
                    reason: item.error.clone().unwrap_or_default(),
                    retry_at: None,
                },
                (ItemState::Pending, action) if item.error.is_some() => ObservedState::Failed {
                    action,
                    reason: item.error.clone().unwrap_or_default(),
                    retry_at: Some(item.retry_at.unwrap_or(item.last_transition)),
                },
                (ItemState::Pending, ImageAction::Pull) => continue,
                (ItemState::Pending, ImageAction::Purge) => ObservedState::Present,
            };
            current.items.insert(
                (item.node.clone(), item.image.clone()),
                ObservedItem {
                    state,
                    attempts: item.attempts,
                    last_transition: item.last_transition,
                    job_uid: item.job_uid.clone(),
                },
            );
        }
        current
    }

    /// Look up one pair
    pub fn get(&self, node: &str, image: &str) -> Option<&ObservedItem> {
        self.items.get(&(node.to_string(), image.to_string()))
    }

    /// Mutable lookup of one pair
    pub fn get_mut(&mut self, node: &str, image: &str) -> Option<&mut ObservedItem> {
        self.items.get_mut(&(node.to_string(), image.to_string()))
    }

    /// Set the state of a pair, recording a transition only when it changes
    pub fn set(&mut self, node: &str, image: &str, state: ObservedState, now: DateTime<Utc>) {
        match self.get_mut(node, image) {
            Some(item) => {
                if item.state != state {
                    item.state = state;
                    item.last_transition = now;
                }
            }
            None => {
                self.items.insert(
                    (node.to_string(), image.to_string()),
                    ObservedItem::new(state, now),
                );
            }
        }
    }

    /// Forget a pair entirely (it is absent)
    pub fn remove(&mut self, node: &str, image: &str) -> Option<ObservedItem> {
        self.items.remove(&(node.to_string(), image.to_string()))
    }

    /// Drop every pair on nodes not in `live_nodes`
    pub fn retain_nodes(&mut self, live_nodes: &BTreeSet<String>) -> usize {
        let before = self.items.len();
        self.items.retain(|(node, _), _| live_nodes.contains(node));
        before - self.items.len()
    }

    /// Give terminally failed pairs a fresh retry budget, eligible at `now`
    pub fn reset_terminal_failures(&mut self, now: DateTime<Utc>) {
        for item in self.items.values_mut() {
            if let ObservedState::Failed { retry_at, .. } = &mut item.state {
                if retry_at.is_none() {
                    *retry_at = Some(now);
                }
                item.attempts = 0;
            }
        }
    }

    /// Iterate pairs in node then image order
    pub fn iter(&self) -> impl Iterator<Item = ((&str, &str), &ObservedItem)> {
        self.items
            .iter()
            .map(|((node, image), item)| ((node.as_str(), image.as_str()), item))
    }

    /// Number of tracked pairs
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Earliest pending retry strictly after `now`
    pub fn next_retry_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.items
            .values()
            .filter_map(|item| match &item.state {
                ObservedState::Failed {
                    retry_at: Some(at), ..
                } if *at > now => Some(*at),
                _ => None,
            })
            .min()
    }
}

/// One atomic unit of required change
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    /// Target node
    pub node: String,
    /// Image reference
    pub image: String,
    /// Pull or purge
    pub action: ImageAction,
}

impl WorkItem {
    /// Create a work item
    pub fn new(node: impl Into<String>, image: impl Into<String>, action: ImageAction) -> Self {
        Self {
            node: node.into(),
            image: image.into(),
            action,
        }
    }
}

fn retry_due(retry_at: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    retry_at.map(|at| at <= now).unwrap_or(false)
}

/// Compute the WorkItems that converge `current` to `desired`.
///
/// Items come out grouped by node, then ordered by image. Pairs that are
/// present, or already moving in the desired direction, produce nothing, so
/// re-running the diff after dispatch yields an empty set.
pub fn diff(desired: &DesiredState, current: &CurrentState, now: DateTime<Utc>) -> Vec<WorkItem> {
    let mut work = Vec::new();

    for (node, image) in desired.iter() {
        let pull = match current.get(node, image).map(|item| &item.state) {
            None => true,
            Some(ObservedState::Present | ObservedState::Pulling) => false,
            // Purge in flight for an image wanted again; the orchestrator cancels it
            Some(ObservedState::Purging) => true,
            Some(ObservedState::Failed {
                action: ImageAction::Pull,
                retry_at,
                ..
            }) => retry_due(retry_at, now),
            Some(ObservedState::Failed {
                action: ImageAction::Purge,
                ..
            }) => true,
        };
        if pull {
            work.push(WorkItem::new(node, image, ImageAction::Pull));
        }
    }

    for ((node, image), item) in current.iter() {
        if desired.contains(node, image) {
            continue;
        }
        let purge = match &item.state {
            ObservedState::Present => true,
            ObservedState::Failed {
                action: ImageAction::Purge,
                retry_at,
                ..
            } => retry_due(retry_at, now),
            // Pulls that became moot are cancelled, not purged
            ObservedState::Pulling
            | ObservedState::Purging
            | ObservedState::Failed {
                action: ImageAction::Pull,
                ..
            } => false,
        };
        if purge {
            work.push(WorkItem::new(node, image, ImageAction::Purge));
        }
    }

    work.sort();
    work
}
