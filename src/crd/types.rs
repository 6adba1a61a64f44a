//! Shared status types for the ImageCache CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What a WorkItem asks a node to do with an image
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ImageAction {
    /// Pull the image into the node's image store
    Pull,
    /// Remove the image from the node's image store
    Purge,
}

impl ImageAction {
    /// Lowercase form used in Job names and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Purge => "purge",
        }
    }

    /// Parse the lowercase label form
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "pull" => Some(Self::Pull),
            "purge" => Some(Self::Purge),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource-level summary phase, derived from item states
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImageCachePhase {
    /// Not yet processed by the controller
    #[default]
    Pending,
    /// Pulls or purges are in flight or waiting to be dispatched
    Processing,
    /// Every desired image is present and every purge completed
    Succeeded,
    /// Some items succeeded and some failed terminally
    PartialSuccess,
    /// Every item failed, or the specification was rejected
    Failed,
}

impl ImageCachePhase {
    /// Whether no further work is expected without an external change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialSuccess | Self::Failed)
    }
}

impl std::fmt::Display for ImageCachePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Processing => write!(f, "Processing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::PartialSuccess => write!(f, "PartialSuccess"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-item state as persisted in status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ItemState {
    /// Work is needed but no Job carries it yet (deferred or awaiting retry)
    Pending,
    /// A pull Job is running for this item
    Pulling,
    /// The image was pulled onto the node
    Present,
    /// A purge Job is running for this item
    Purging,
    /// The retry budget is spent; operator intervention required
    Failed,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Pulling => write!(f, "Pulling"),
            Self::Present => write!(f, "Present"),
            Self::Purging => write!(f, "Purging"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status record for one (node, image) pair
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageItemStatus {
    /// Target node name
    pub node: String,

    /// Image reference
    pub image: String,

    /// Last action requested for this pair
    pub action: ImageAction,

    /// Current state
    pub state: ItemState,

    /// Failure detail from the last failed Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Failed Job attempts since the last success or spec change
    #[serde(default)]
    pub attempts: u32,

    /// Earliest time a failed item may be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    /// UID of the last Job whose outcome was folded into this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uid: Option<String>,

    /// When `state` last changed
    pub last_transition: DateTime<Utc>,
}
