//! ImageCache reconciliation
//!
//! Each pass is observe-diff-act: validate the spec, resolve the desired
//! (node, image) set, fold Job outcomes into the observed state, create or
//! cancel Jobs for the difference, and write one aggregated status.

pub mod diff;
pub mod jobs;
pub mod nodes;
pub mod orchestrate;
pub mod queue;
pub mod reconcile;
pub mod runner;
pub mod status;
pub mod validate;

#[cfg(test)]
mod fake;

pub use diff::{diff, CurrentState, DesiredState, ObservedItem, ObservedState, WorkItem};
pub use jobs::{JobPhase, JobRecord, JobSubstrate, KubeJobSubstrate};
pub use nodes::{KubeNodeDirectory, NodeDirectory, NodeInfo};
pub use orchestrate::{observe_jobs, orchestrate, JobObservation, Orchestration};
pub use queue::WorkQueue;
pub use reconcile::{
    mark_exhausted, reconcile, Action, Context, ContextBuilder, KubeResourceStore,
    ReconcileOutcome, ResourceKey, ResourceStore,
};
pub use runner::{build_watchers, Controller, ControllerEvent, EVENT_CHANNEL_CAPACITY};
pub use validate::validate;
