//! Fledge - CRD-driven Kubernetes controller that warms node image caches
//!
//! An `ImageCache` resource lists container images together with node
//! selectors. The controller runs short-lived Jobs pinned to each matching
//! node that pull the images ahead of time, and purge them again when they
//! leave the spec or the resource is marked for purging.
//!
//! # Modules
//!
//! - [`crd`] - The ImageCache Custom Resource Definition
//! - [`controller`] - Validation, diffing, Job orchestration and the control loop
//! - [`config`] - Controller tunables
//! - [`retry`] - Exponential backoff helpers
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
