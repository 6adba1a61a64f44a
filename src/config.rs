//! Controller configuration
//!
//! [`ControllerConfig`] is built once by `main` from command-line flags and
//! handed to every component through the controller context.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default container image used by purge Jobs (must ship `crictl`)
pub const DEFAULT_IMAGE_MANAGER_IMAGE: &str = "ghcr.io/fledge-dev/image-manager:v1";

/// Default image whose static `echo` lets pull Jobs exit without a shell
pub const DEFAULT_BUSYBOX_IMAGE: &str = "busybox:1.36-musl";

/// Default host path of the container runtime socket
pub const DEFAULT_CRI_SOCKET_PATH: &str = "/run/containerd/containerd.sock";

/// Tunables for the reconciliation engine
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Interval at which every ImageCache is re-enqueued
    pub resync_interval: Duration,
    /// Execution deadline applied to each Job
    pub job_deadline: Duration,
    /// Retry policy for failed Jobs (attempt budget per item)
    pub job_retry: RetryConfig,
    /// Retry policy for transient reconcile failures (queue backoff)
    pub reconcile_retry: RetryConfig,
    /// Requeue interval while Jobs are still running
    pub job_poll_interval: Duration,
    /// Image used by purge Jobs
    pub image_manager_image: String,
    /// Image that supplies `echo` to pull Jobs
    pub busybox_image: String,
    /// Host path of the CRI socket mounted into purge Jobs
    pub cri_socket_path: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            job_deadline: Duration::from_secs(300),
            job_retry: RetryConfig::exponential(
                3,
                Duration::from_secs(30),
                Duration::from_secs(300),
            ),
            reconcile_retry: RetryConfig::exponential(
                10,
                Duration::from_millis(500),
                Duration::from_secs(300),
            ),
            job_poll_interval: Duration::from_secs(15),
            image_manager_image: DEFAULT_IMAGE_MANAGER_IMAGE.to_string(),
            busybox_image: DEFAULT_BUSYBOX_IMAGE.to_string(),
            cri_socket_path: DEFAULT_CRI_SOCKET_PATH.to_string(),
        }
    }
}
