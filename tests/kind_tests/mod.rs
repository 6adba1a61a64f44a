//! Integration tests for the fledge controller
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how cluster operators warm and clean node image caches.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and deleting
//!   ImageCache resources through the Kubernetes API
//!
//! - `caching_lifecycle`: Stories about the controller pulling, purging and
//!   reporting status against real nodes and Jobs
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod caching_lifecycle;
mod crd_operations;
mod helpers;
