//! Error types for the fledge controller

use thiserror::Error;

/// Reasons an ImageCache specification is rejected before any work is scheduled.
///
/// Validation errors are permanent: retrying an unchanged specification
/// cannot succeed, so they are surfaced verbatim in status and never requeued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The ImageCache handle itself could not be obtained
    #[error("Unable to obtain reference to image cache")]
    Reference,

    /// A cache spec entry lists no images
    #[error("No images specified within image list")]
    EmptyImageList,

    /// A cache spec entry lists the same image twice
    #[error("Duplicate image names within image list: {image}")]
    DuplicateImage {
        /// The repeated image reference
        image: String,
    },

    /// Listing nodes with a non-empty selector failed
    #[error("Error listing nodes using nodeselector {selector}: {message}")]
    NodeList {
        /// Rendered selector (`k=v,k2=v2`)
        selector: String,
        /// Underlying listing failure
        message: String,
    },

    /// Listing every node (empty selector) failed
    #[error("Error listing nodes using nodeselector labels.Everything(): {message}")]
    NodeListAll {
        /// Underlying listing failure
        message: String,
    },

    /// A non-empty selector matched no live node
    #[error("NodeSelector {selector} did not match any nodes")]
    NoMatchingNodes {
        /// Rendered selector (`k=v,k2=v2`)
        selector: String,
    },
}

impl ValidationError {
    /// Whether the failure came from listing nodes rather than the spec itself.
    ///
    /// Listing failures are retried by the control loop; an unchanged spec
    /// may validate once the API server recovers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NodeList { .. } | Self::NodeListAll { .. })
    }
}

/// Main error type for fledge operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The ImageCache specification is invalid
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A Job ran and reported failure
    #[error("job {job} failed: {message}")]
    JobExecution {
        /// Name of the failed Job
        job: String,
        /// Failure detail reported by the Job
        message: String,
    },

    /// A Job exceeded its execution deadline
    #[error("job {job} exceeded its deadline")]
    JobTimeout {
        /// Name of the timed-out Job
        job: String,
    },

    /// The resource store could not be read or written
    #[error("resource store error: {0}")]
    Store(String),

    /// The Job execution substrate rejected an operation
    #[error("job substrate error: {0}")]
    Substrate(String),

    /// The node directory could not be listed
    #[error("node directory error: {0}")]
    NodeDirectory(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violated inside the controller
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a resource store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a job substrate error with the given message
    pub fn substrate(msg: impl Into<String>) -> Self {
        Self::Substrate(msg.into())
    }

    /// Create a node directory error with the given message
    pub fn node_directory(msg: impl Into<String>) -> Self {
        Self::NodeDirectory(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the control loop should requeue the resource with backoff.
    ///
    /// Spec problems and serialization failures are permanent; everything
    /// that talks to the cluster may recover on its own, node listing
    /// during validation included.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(e) => e.is_transient(),
            Self::Serialization(_) => false,
            _ => true,
        }
    }
}
