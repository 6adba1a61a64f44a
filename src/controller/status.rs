//! Status aggregation
//!
//! The phase is derived from item states and nothing else. Bookkeeping
//! fields (timestamps, observed generation, reason) ride along but never
//! feed back into the phase.

use chrono::{DateTime, Utc};

use crate::controller::diff::{CurrentState, DesiredState, ObservedState, WorkItem};
use crate::crd::{ImageAction, ImageCachePhase, ImageCacheStatus, ImageItemStatus, ItemState};
use crate::error::ValidationError;
use crate::Error;

/// Reason set when the specification was rejected
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
/// Reason set when transient failures used up the reconcile retry budget
pub const REASON_RETRY_EXHAUSTED: &str = "RetryBudgetExhausted";
/// Reason set when some or all items failed terminally
pub const REASON_IMAGES_FAILED: &str = "ImagesFailed";

/// Derive the resource phase from item states.
///
/// - any item pending or in flight: Processing
/// - no failed item: Succeeded (including the empty set)
/// - failures next to present items: PartialSuccess
/// - otherwise: Failed
pub fn derive_phase<I>(states: I) -> ImageCachePhase
where
    I: IntoIterator<Item = ItemState>,
{
    let (mut present, mut failed, mut active) = (0usize, 0usize, 0usize);
    for state in states {
        match state {
            ItemState::Pending | ItemState::Pulling | ItemState::Purging => active += 1,
            ItemState::Present => present += 1,
            ItemState::Failed => failed += 1,
        }
    }

    if active > 0 {
        ImageCachePhase::Processing
    } else if failed == 0 {
        ImageCachePhase::Succeeded
    } else if present > 0 {
        ImageCachePhase::PartialSuccess
    } else {
        ImageCachePhase::Failed
    }
}

/// Whether the resource is stopped for a permanent reason at this generation
pub fn is_permanently_failed(status: Option<&ImageCacheStatus>, generation: Option<i64>) -> bool {
    status
        .map(|s| {
            s.phase == ImageCachePhase::Failed
                && matches!(
                    s.reason.as_deref(),
                    Some(REASON_VALIDATION_FAILED) | Some(REASON_RETRY_EXHAUSTED)
                )
                && s.observed_generation == generation
        })
        .unwrap_or(false)
}

fn item_status(
    node: &str,
    image: &str,
    action: ImageAction,
    state: ItemState,
    error: Option<String>,
    retry_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ImageItemStatus {
    ImageItemStatus {
        node: node.to_string(),
        image: image.to_string(),
        action,
        state,
        error,
        attempts: 0,
        retry_at,
        job_uid: None,
        last_transition: now,
    }
}

fn render_items(
    previous: Option<&ImageCacheStatus>,
    desired: &DesiredState,
    current: &CurrentState,
    pending: &[WorkItem],
    now: DateTime<Utc>,
) -> Vec<ImageItemStatus> {
    let pending_for = |node: &str, image: &str| {
        pending
            .iter()
            .find(|w| w.node == node && w.image == image)
            .map(|w| w.action)
    };
    let mut items = Vec::with_capacity(current.len() + pending.len());

    for ((node, image), observed) in current.iter() {
        let mut item = match (&observed.state, pending_for(node, image)) {
            (
                ObservedState::Failed {
                    action: ImageAction::Pull,
                    ..
                },
                _,
            ) if !desired.contains(node, image) => continue,
            (ObservedState::Failed { reason, retry_at, .. }, Some(action)) => {
                item_status(node, image, action, ItemState::Pending, Some(reason.clone()), *retry_at, now)
            }
            (_, Some(action)) => item_status(node, image, action, ItemState::Pending, None, None, now),
            (ObservedState::Present, None) => {
                item_status(node, image, ImageAction::Pull, ItemState::Present, None, None, now)
            }
            (ObservedState::Pulling, None) => {
                item_status(node, image, ImageAction::Pull, ItemState::Pulling, None, None, now)
            }
            (ObservedState::Purging, None) => {
                item_status(node, image, ImageAction::Purge, ItemState::Purging, None, None, now)
            }
            (
                ObservedState::Failed {
                    action,
                    reason,
                    retry_at: Some(at),
                },
                None,
            ) => item_status(node, image, *action, ItemState::Pending, Some(reason.clone()), Some(*at), now),
            (
                ObservedState::Failed {
                    action,
                    reason,
                    retry_at: None,
                },
                None,
            ) => item_status(node, image, *action, ItemState::Failed, Some(reason.clone()), None, now),
        };
        item.attempts = observed.attempts;
        item.job_uid = observed.job_uid.clone();
        items.push(item);
    }

    for work in pending {
        if current.get(&work.node, &work.image).is_none() {
            items.push(item_status(
                &work.node,
                &work.image,
                work.action,
                ItemState::Pending,
                None,
                None,
                now,
            ));
        }
    }

    for item in &mut items {
        let unchanged = previous
            .and_then(|p| {
                p.items
                    .iter()
                    .find(|old| old.node == item.node && old.image == item.image)
            })
            .filter(|old| old.state == item.state && old.action == item.action);
        item.last_transition = unchanged.map(|old| old.last_transition).unwrap_or(now);
    }

    items.sort_by(|a, b| (&a.node, &a.image).cmp(&(&b.node, &b.image)));
    items
}

fn summary(items: &[ImageItemStatus]) -> String {
    let count = |state: ItemState| items.iter().filter(|i| i.state == state).count();
    format!(
        "{} present, {} in progress, {} failed",
        count(ItemState::Present),
        count(ItemState::Pending) + count(ItemState::Pulling) + count(ItemState::Purging),
        count(ItemState::Failed)
    )
}

/// Fold one pass's outcome into a new status.
///
/// `pending` is the work the orchestrator could not dispatch this pass.
pub fn aggregate(
    previous: Option<&ImageCacheStatus>,
    desired: &DesiredState,
    current: &CurrentState,
    pending: &[WorkItem],
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ImageCacheStatus {
    let items = render_items(previous, desired, current, pending, now);
    let phase = derive_phase(items.iter().map(|i| i.state));

    let was_quiescent = previous
        .map(|p| p.phase.is_terminal() || p.phase == ImageCachePhase::Pending)
        .unwrap_or(true);
    let start_time = match (phase.is_terminal(), was_quiescent) {
        (false, true) => Some(now),
        _ => previous.and_then(|p| p.start_time).or(Some(now)),
    };
    let reason = match phase {
        ImageCachePhase::PartialSuccess | ImageCachePhase::Failed => {
            Some(REASON_IMAGES_FAILED.to_string())
        }
        _ => None,
    };
    let completion_time = if phase.is_terminal() {
        previous
            .filter(|p| p.phase == phase && p.reason == reason)
            .and_then(|p| p.completion_time)
            .or(Some(now))
    } else {
        None
    };

    ImageCacheStatus {
        phase,
        reason,
        message: Some(summary(&items)),
        items,
        settled_jobs: Vec::new(),
        observed_generation: generation,
        start_time,
        completion_time,
    }
}

fn failed_status(
    previous: Option<&ImageCacheStatus>,
    reason: &str,
    message: String,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ImageCacheStatus {
    ImageCacheStatus {
        phase: ImageCachePhase::Failed,
        reason: Some(reason.to_string()),
        message: Some(message),
        // Keep what is known to be cached so a later fix can purge it
        items: previous.map(|p| p.items.clone()).unwrap_or_default(),
        settled_jobs: previous.map(|p| p.settled_jobs.clone()).unwrap_or_default(),
        observed_generation: generation,
        start_time: previous.and_then(|p| p.start_time),
        completion_time: Some(now),
    }
}

/// Status for a specification that failed validation
pub fn validation_failed_status(
    previous: Option<&ImageCacheStatus>,
    err: &ValidationError,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ImageCacheStatus {
    failed_status(previous, REASON_VALIDATION_FAILED, err.to_string(), generation, now)
}

/// Status for a resource whose transient failures used up the retry budget
pub fn exhausted_status(
    previous: Option<&ImageCacheStatus>,
    err: &Error,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ImageCacheStatus {
    failed_status(previous, REASON_RETRY_EXHAUSTED, err.to_string(), generation, now)
}
