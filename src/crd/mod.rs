//! Custom Resource Definitions for fledge
//!
//! This module contains the ImageCache CRD and its status types.

mod image_cache;
mod types;

pub use image_cache::{
    render_selector, CacheSpecEntry, ImageCache, ImageCacheSpec, ImageCacheStatus,
    PURGE_ANNOTATION,
};
pub use types::{ImageAction, ImageCachePhase, ImageItemStatus, ItemState};
