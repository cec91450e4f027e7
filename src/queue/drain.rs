//! Drain pass — replays queued actions through the applier's dispatch path.
//!
//! Callers must make sure only one pass runs at a time; the engine routes
//! every drain through a [`Deduplicator`](crate::dedup::Deduplicator) under a
//! fixed key.

use chrono::Utc;
use serde::Serialize;

use crate::applier::OptimisticApplier;
use crate::engine::events::{DiscardReason, EngineEvent};

use super::{PendingAction, RequeueOutcome};

/// Counts for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub requeued: usize,
    pub discarded: usize,
    /// Actions still queued when the pass ended.
    pub remaining: usize,
}

/// Process the queue in drain order until it is empty, the device goes
/// offline, or an action fails transiently.
pub(crate) async fn drain(applier: &OptimisticApplier) -> DrainReport {
    let queue = applier.queue();
    let mut report = DrainReport::default();

    for action in queue.expire(Utc::now()) {
        discard(applier, action, DiscardReason::Expired);
        report.discarded += 1;
    }

    tracing::debug!(queued = queue.len(), "drain pass started");

    loop {
        if !applier.connectivity().is_online() {
            tracing::debug!("went offline; stopping drain pass");
            break;
        }
        let Some(action) = queue.take_next() else {
            break;
        };

        let settled = applier
            .dispatch(&action.payload)
            .await
            .and_then(|ack| applier.reconcile(&action.payload, ack));
        match settled {
            Ok(entity) => {
                queue.complete(action.id);
                report.applied += 1;
                applier.emit(EngineEvent::ActionApplied {
                    action_id: action.id,
                    action_type: action.action_type(),
                    collection: action.payload.collection().clone(),
                    id: entity.map_or_else(|| action.payload.target().clone(), |e| e.id),
                });
            }
            Err(e) if e.is_transient() => {
                match queue.requeue(action.id) {
                    Some(RequeueOutcome::Requeued { attempts }) => {
                        tracing::debug!(
                            action_id = action.id,
                            attempts,
                            error = %e,
                            "transient failure; action requeued"
                        );
                        report.requeued += 1;
                    }
                    Some(RequeueOutcome::Exhausted(exhausted)) => {
                        let attempts = exhausted.attempts;
                        discard(
                            applier,
                            exhausted,
                            DiscardReason::Exhausted {
                                attempts,
                                last_error: e,
                            },
                        );
                        report.discarded += 1;
                    }
                    None => {}
                }
                break;
            }
            Err(e) => {
                if let Some(rejected) = queue.discard(action.id) {
                    discard(applier, rejected, DiscardReason::Rejected(e));
                    report.discarded += 1;
                }
            }
        }
    }

    report.remaining = queue.len();
    tracing::debug!(
        applied = report.applied,
        requeued = report.requeued,
        discarded = report.discarded,
        remaining = report.remaining,
        "drain pass finished"
    );
    applier.emit(EngineEvent::DrainFinished(report));
    report
}

/// Revert a dropped action and everything queued behind its placeholder.
fn discard(applier: &OptimisticApplier, action: PendingAction, reason: DiscardReason) {
    tracing::warn!(
        action_id = action.id,
        action_type = action.action_type(),
        reason = ?reason,
        "discarding queued action"
    );

    // Later writes against a never-created placeholder cannot succeed.
    let dependents = match &action.reconciliation {
        Some(reconciliation) => applier.queue().cancel_for_temp(&reconciliation.temp_id),
        None => Vec::new(),
    };

    if let Some(snapshot) = &action.rollback {
        applier.state().for_key(snapshot.collection()).restore(snapshot);
    }
    applier.emit(EngineEvent::ActionDiscarded { action, reason });

    for dependent in dependents {
        applier.emit(EngineEvent::ActionDiscarded {
            action: dependent,
            reason: DiscardReason::Cancelled,
        });
    }
}
