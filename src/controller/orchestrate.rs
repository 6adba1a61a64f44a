//! Job orchestration
//!
//! A reconcile pass drives Jobs in three steps:
//! 1. [`observe_jobs`] folds live Job outcomes into current state
//! 2. [`orchestrate`] cancels Jobs that no longer serve the desired state,
//!    diffs, and creates at most one Job per (node, action) bucket
//! 3. [`cleanup_finished`] deletes finished Jobs once their outcome has been
//!    persisted in status
//!
//! Buckets never run two Jobs at once. Work that cannot be dispatched this
//! pass (bucket busy, node just had a Job cancelled, or an opposite Job still
//! covers the image) is reported back as pending and picked up again by a
//! later pass.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::controller::diff::{diff, CurrentState, DesiredState, ObservedState, WorkItem};
use crate::controller::jobs::{build_job, JobOwner, JobPhase, JobRecord, JobSubstrate};
use crate::crd::ImageAction;
use crate::retry::RetryConfig;
use crate::Error;

/// Live Jobs of one ImageCache, split by outcome
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobObservation {
    /// Jobs still running
    pub running: Vec<JobRecord>,
    /// Jobs that finished (folded into current state, awaiting deletion)
    pub finished: Vec<JobRecord>,
}

/// Everything one orchestration pass did or left undone
#[derive(Debug, Default)]
pub struct Orchestration {
    /// Jobs created this pass
    pub created: Vec<JobRecord>,
    /// Jobs cancelled because their work became moot
    pub cancelled: Vec<JobRecord>,
    /// Jobs left running
    pub running: Vec<JobRecord>,
    /// Finished Jobs to delete after status is written
    pub finished: Vec<JobRecord>,
    /// Work that could not be dispatched this pass
    pub pending: Vec<WorkItem>,
    /// Substrate failures hit while creating or cancelling
    pub errors: Vec<Error>,
}

impl Orchestration {
    /// Whether any Job is still expected to report an outcome
    pub fn in_flight(&self) -> bool {
        !self.created.is_empty() || !self.running.is_empty()
    }
}

fn at_offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn in_flight_state(action: ImageAction) -> ObservedState {
    match action {
        ImageAction::Pull => ObservedState::Pulling,
        ImageAction::Purge => ObservedState::Purging,
    }
}

fn fold_finished(current: &mut CurrentState, job: &JobRecord, retry: &RetryConfig, now: DateTime<Utc>) {
    for image in &job.images {
        // In-flight items carry the Job's UID too; only a settled one has seen the outcome
        let folded = current.get(&job.node, image).is_some_and(|item| {
            item.job_uid.as_deref() == Some(job.uid.as_str())
                && !matches!(item.state, ObservedState::Pulling | ObservedState::Purging)
        });
        if folded {
            continue;
        }

        match (&job.phase, job.action) {
            (JobPhase::Succeeded, ImageAction::Pull) => {
                current.set(&job.node, image, ObservedState::Present, now);
                if let Some(item) = current.get_mut(&job.node, image) {
                    item.attempts = 0;
                    item.job_uid = Some(job.uid.clone());
                }
            }
            (JobPhase::Succeeded, ImageAction::Purge) => {
                current.remove(&job.node, image);
            }
            (JobPhase::Failed { .. } | JobPhase::TimedOut, action) => {
                let attempts = current
                    .get(&job.node, image)
                    .map(|item| item.attempts)
                    .unwrap_or(0)
                    + 1;
                let retry_at = if retry.is_exhausted(attempts) {
                    None
                } else {
                    Some(at_offset(now, retry.delay_for(attempts - 1)))
                };
                let reason = job
                    .failure()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                current.set(
                    &job.node,
                    image,
                    ObservedState::Failed {
                        action,
                        reason,
                        retry_at,
                    },
                    now,
                );
                if let Some(item) = current.get_mut(&job.node, image) {
                    item.attempts = attempts;
                    item.job_uid = Some(job.uid.clone());
                }
            }
            (JobPhase::Running, _) => {}
        }
    }
}

/// Fold live Job outcomes into `current`.
///
/// Running Jobs mark their items in flight. Finished Jobs are folded once:
/// Jobs listed in `settled` (persisted by an earlier pass whose cleanup
/// failed) are skipped, and an item already stamped with the Job's UID is
/// not counted again, so a failed status write cannot double-count a
/// failure. Items claiming a Job
/// that no longer exists fall back to what is known for certain, and items
/// on nodes that left the cluster are dropped.
pub fn observe_jobs(
    current: &mut CurrentState,
    jobs: Vec<JobRecord>,
    live_nodes: &BTreeSet<String>,
    settled: &BTreeSet<String>,
    retry: &RetryConfig,
    now: DateTime<Utc>,
) -> JobObservation {
    let mut observation = JobObservation::default();

    for job in jobs {
        if !job.phase.is_terminal() {
            if live_nodes.contains(&job.node) {
                for image in &job.images {
                    current.set(&job.node, image, in_flight_state(job.action), now);
                    if let Some(item) = current.get_mut(&job.node, image) {
                        item.job_uid = Some(job.uid.clone());
                    }
                }
            }
            observation.running.push(job);
            continue;
        }

        if live_nodes.contains(&job.node) && !settled.contains(&job.uid) {
            fold_finished(current, &job, retry, now);
            if let Some(err) = job.failure() {
                warn!(job = %job.name, node = %job.node, error = %err, "image job failed");
            }
        }
        observation.finished.push(job);
    }

    let running_uids: BTreeSet<&str> = observation
        .running
        .iter()
        .map(|job| job.uid.as_str())
        .collect();
    let orphaned: Vec<(String, String, ObservedState)> = current
        .iter()
        .filter(|(_, item)| {
            matches!(item.state, ObservedState::Pulling | ObservedState::Purging)
                && !item
                    .job_uid
                    .as_deref()
                    .map(|uid| running_uids.contains(uid))
                    .unwrap_or(false)
        })
        .map(|((node, image), item)| (node.to_string(), image.to_string(), item.state.clone()))
        .collect();
    for (node, image, state) in orphaned {
        debug!(%node, %image, "in-flight item lost its job");
        match state {
            // Pulls are idempotent; forget and let the diff re-issue
            ObservedState::Pulling => {
                current.remove(&node, &image);
            }
            _ => current.set(&node, &image, ObservedState::Present, now),
        }
    }

    let pruned = current.retain_nodes(live_nodes);
    if pruned > 0 {
        info!(pruned, "dropped items on nodes that left the cluster");
    }

    observation
}

/// Whether a running Job no longer serves the desired state
fn is_moot(job: &JobRecord, desired: &DesiredState, live_nodes: &BTreeSet<String>) -> bool {
    if !live_nodes.contains(&job.node) {
        return true;
    }
    job.images.iter().all(|image| match job.action {
        ImageAction::Pull => !desired.contains(&job.node, image),
        ImageAction::Purge => desired.contains(&job.node, image),
    })
}

/// Cancel moot Jobs, diff, and dispatch one Job per (node, action) bucket.
///
/// Substrate failures do not abort the pass: they are collected so the
/// caller can persist partial progress before surfacing them.
#[allow(clippy::too_many_arguments)]
pub async fn orchestrate(
    substrate: &dyn JobSubstrate,
    owner: &JobOwner,
    desired: &DesiredState,
    current: &mut CurrentState,
    observation: JobObservation,
    live_nodes: &BTreeSet<String>,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> Orchestration {
    let mut result = Orchestration {
        finished: observation.finished,
        ..Default::default()
    };
    let mut cancelled_nodes = BTreeSet::new();

    for job in observation.running {
        if !is_moot(&job, desired, live_nodes) {
            result.running.push(job);
            continue;
        }
        match substrate.delete(&owner.namespace, &job.name).await {
            Ok(()) => {
                info!(job = %job.name, node = %job.node, action = %job.action, "cancelled moot job");
                for image in &job.images {
                    let owned = current
                        .get(&job.node, image)
                        .and_then(|item| item.job_uid.as_deref())
                        == Some(job.uid.as_str());
                    if owned {
                        current.remove(&job.node, image);
                    }
                }
                cancelled_nodes.insert(job.node.clone());
                result.cancelled.push(job);
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "failed to cancel moot job");
                result.errors.push(e);
                result.running.push(job);
            }
        }
    }

    let work = diff(desired, current, now);
    let mut buckets: BTreeMap<(String, ImageAction), Vec<WorkItem>> = BTreeMap::new();
    for item in work {
        buckets
            .entry((item.node.clone(), item.action))
            .or_default()
            .push(item);
    }

    for ((node, action), items) in buckets {
        let busy = cancelled_nodes.contains(&node)
            || result
                .running
                .iter()
                .any(|job| job.node == node && job.action == action);
        if busy {
            debug!(%node, %action, deferred = items.len(), "bucket busy, deferring");
            result.pending.extend(items);
            continue;
        }

        let (blocked, ready): (Vec<WorkItem>, Vec<WorkItem>) =
            items.into_iter().partition(|item| {
                result.running.iter().any(|job| {
                    job.node == item.node
                        && job.action != item.action
                        && job.images.contains(&item.image)
                })
            });
        result.pending.extend(blocked);
        if ready.is_empty() {
            continue;
        }

        let images: Vec<String> = ready.iter().map(|item| item.image.clone()).collect();
        let created = match build_job(owner, &node, action, &images, config) {
            Ok(job) => substrate.create(job).await,
            Err(e) => Err(e),
        };
        match created {
            Ok(record) => {
                info!(job = %record.name, %node, %action, images = images.len(), "created image job");
                for image in &images {
                    current.set(&node, image, in_flight_state(action), now);
                    if let Some(item) = current.get_mut(&node, image) {
                        item.job_uid = Some(record.uid.clone());
                    }
                }
                result.created.push(record);
            }
            Err(e) => {
                warn!(%node, %action, error = %e, "failed to create image job");
                result.errors.push(e);
                result.pending.extend(ready);
            }
        }
    }

    result.pending.sort();
    result
}

/// Delete finished Jobs after their outcome has been persisted
pub async fn cleanup_finished(
    substrate: &dyn JobSubstrate,
    namespace: &str,
    finished: &[JobRecord],
) -> Result<(), Error> {
    for job in finished {
        substrate.delete(namespace, &job.name).await?;
    }
    Ok(())
}

/// Delete every Job of an ImageCache (used when it is deleted)
pub async fn cancel_all(
    substrate: &dyn JobSubstrate,
    namespace: &str,
    owner_uid: &str,
) -> Result<usize, Error> {
    let jobs = substrate.list(namespace, owner_uid).await?;
    for job in &jobs {
        substrate.delete(namespace, &job.name).await?;
    }
    Ok(jobs.len())
}
