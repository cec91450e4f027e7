//! Offline Action Queue — durable, priority-ordered log of mutations that
//! could not reach the remote service.
//!
//! Actions are kept in drain order at all times: higher priority first, ties
//! by enqueue sequence. The whole list is persisted after every change so it
//! survives a restart with its order intact.
//!
//! Per-action lifecycle:
//!
//! ```text
//! Pending -> Processing -> Applied   (removed)
//!                       -> Requeued  (back to Pending, same position)
//!                       -> Discarded (removed, snapshot restored by caller)
//! ```

pub mod drain;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::remote::RemoteMutation;
use crate::storage::PersistedState;
use crate::types::{CollectionKey, EntityId, EntitySnapshot};

pub use drain::DrainReport;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Processing,
}

/// Where the optimistic placeholder of a queued create lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub temp_id: EntityId,
    pub collection: CollectionKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Enqueue sequence number; breaks priority ties.
    pub id: u64,
    pub payload: RemoteMutation,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i32,
    /// Failed dispatches so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,
    /// State captured before the optimistic write, restored on discard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<EntitySnapshot>,
    pub status: ActionStatus,
}

impl PendingAction {
    pub fn action_type(&self) -> &'static str {
        match self.payload {
            RemoteMutation::ToggleLike { .. } => "toggle_like",
            RemoteMutation::Create { .. } => "create",
            RemoteMutation::Edit { .. } => "edit",
            RemoteMutation::Remove { .. } => "remove",
        }
    }

    /// Whether the action must wait for `temp_id` to be created remotely.
    fn depends_on(&self, temp_id: &EntityId) -> bool {
        self.payload.target() == temp_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Defaults to the mutation's own priority (see [`default_priority`]).
    pub priority: Option<i32>,
    pub reconciliation: Option<Reconciliation>,
    pub rollback: Option<EntitySnapshot>,
}

/// Default drain priority per mutation type. Creates drain first so that
/// writes made against their placeholders can be remapped before dispatch.
pub fn default_priority(mutation: &RemoteMutation) -> i32 {
    match mutation {
        RemoteMutation::Create { .. } => 20,
        RemoteMutation::Edit { .. } => 15,
        RemoteMutation::ToggleLike { .. } => 10,
        RemoteMutation::Remove { .. } => 5,
    }
}

/// Result of putting a failed action back.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    Requeued { attempts: u32 },
    /// The retry budget is spent; the action has been removed.
    Exhausted(PendingAction),
}

// ============================================================================
// OfflineQueue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    actions: Vec<PendingAction>,
    next_id: u64,
}

pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
    persistence: Option<Arc<PersistedState>>,
    max_attempts: u32,
    max_age: chrono::Duration,
}

impl OfflineQueue {
    pub fn new(
        persistence: Option<Arc<PersistedState>>,
        max_attempts: u32,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                actions: Vec::new(),
                next_id: 1,
            }),
            persistence,
            max_attempts: max_attempts.max(1),
            max_age,
        }
    }

    /// Load the persisted queue, replacing anything in memory.
    ///
    /// An action caught mid-dispatch by a restart is put back to `Pending`.
    pub fn restore(&self) -> Result<usize, StorageError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let mut actions = persistence.load_queue()?;
        for action in &mut actions {
            action.status = ActionStatus::Pending;
        }
        sort_drain_order(&mut actions);

        let mut inner = self.inner.lock();
        inner.next_id = actions.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        inner.actions = actions;
        Ok(inner.actions.len())
    }

    /// Append `payload` and return its action ID.
    pub fn enqueue(&self, payload: RemoteMutation, options: EnqueueOptions) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let priority = options.priority.unwrap_or_else(|| default_priority(&payload));
        let action = PendingAction {
            id,
            payload,
            enqueued_at: Utc::now(),
            priority,
            attempts: 0,
            reconciliation: options.reconciliation,
            rollback: options.rollback,
            status: ActionStatus::Pending,
        };
        tracing::debug!(
            action_id = id,
            action_type = action.action_type(),
            priority,
            "enqueued offline action"
        );

        // Insert after every action that drains before it.
        let at = inner
            .actions
            .iter()
            .position(|a| a.priority < priority)
            .unwrap_or(inner.actions.len());
        inner.actions.insert(at, action);
        self.persist(&inner.actions);
        id
    }

    /// Every action in drain order.
    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.inner.lock().actions.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the create for `temp_id` is queued and not yet handed to a
    /// drain pass. A create in flight can no longer be cancelled.
    pub fn has_unsent_create(&self, temp_id: &EntityId) -> bool {
        self.inner.lock().actions.iter().any(|a| {
            a.status == ActionStatus::Pending
                && matches!(&a.payload, RemoteMutation::Create { temp_id: t, .. } if t == temp_id)
        })
    }

    pub fn has_queued_remove(&self, id: &EntityId) -> bool {
        self.inner
            .lock()
            .actions
            .iter()
            .any(|a| matches!(&a.payload, RemoteMutation::Remove { id: target, .. } if target == id))
    }

    /// Mark the first pending action as `Processing` and hand out a copy.
    pub fn take_next(&self) -> Option<PendingAction> {
        let mut inner = self.inner.lock();
        let action = inner
            .actions
            .iter_mut()
            .find(|a| a.status == ActionStatus::Pending)?;
        action.status = ActionStatus::Processing;
        let taken = action.clone();
        self.persist(&inner.actions);
        Some(taken)
    }

    /// Remove an applied action.
    pub fn complete(&self, id: u64) -> Option<PendingAction> {
        self.remove(id)
    }

    /// Remove an action without applying it.
    pub fn discard(&self, id: u64) -> Option<PendingAction> {
        self.remove(id)
    }

    /// Put a failed action back at its position, or remove it once the retry
    /// budget is spent. Returns `None` for unknown IDs.
    pub fn requeue(&self, id: u64) -> Option<RequeueOutcome> {
        let mut inner = self.inner.lock();
        let index = inner.actions.iter().position(|a| a.id == id)?;
        let action = &mut inner.actions[index];
        action.attempts += 1;
        action.status = ActionStatus::Pending;
        let attempts = action.attempts;

        let outcome = if attempts >= self.max_attempts {
            RequeueOutcome::Exhausted(inner.actions.remove(index))
        } else {
            RequeueOutcome::Requeued { attempts }
        };
        self.persist(&inner.actions);
        Some(outcome)
    }

    /// Remove pending actions older than the maximum age.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<PendingAction> {
        let mut inner = self.inner.lock();
        let max_age = self.max_age;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.actions)
            .into_iter()
            .partition(|a| a.status == ActionStatus::Pending && now - a.enqueued_at >= max_age);
        inner.actions = kept;
        if !expired.is_empty() {
            self.persist(&inner.actions);
        }
        expired
    }

    /// Remove the pending create for `temp_id` and every action that depends
    /// on it. Used when the placeholder is deleted before it was ever sent.
    pub fn cancel_for_temp(&self, temp_id: &EntityId) -> Vec<PendingAction> {
        let mut inner = self.inner.lock();
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.actions)
            .into_iter()
            .partition(|a| a.status == ActionStatus::Pending && a.depends_on(temp_id));
        inner.actions = kept;
        if !cancelled.is_empty() {
            self.persist(&inner.actions);
        }
        cancelled
    }

    /// Point every queued write and rollback snapshot at `real` once the
    /// create for `temp` has been acknowledged. Returns the number of actions
    /// rewritten.
    pub fn remap_id(&self, temp: &EntityId, real: &EntityId) -> usize {
        let mut inner = self.inner.lock();
        let mut remapped = 0;
        for action in &mut inner.actions {
            let mut changed = action.payload.remap_target(temp, real);
            if let Some(snapshot) = &mut action.rollback {
                changed |= snapshot.remap_id(temp, real);
            }
            if changed {
                remapped += 1;
            }
        }
        if remapped > 0 {
            tracing::debug!(temp_id = %temp, id = %real, remapped, "remapped queued actions");
            self.persist(&inner.actions);
        }
        remapped
    }

    fn remove(&self, id: u64) -> Option<PendingAction> {
        let mut inner = self.inner.lock();
        let index = inner.actions.iter().position(|a| a.id == id)?;
        let action = inner.actions.remove(index);
        self.persist(&inner.actions);
        Some(action)
    }

    fn persist(&self, actions: &[PendingAction]) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save_queue(actions) {
                tracing::warn!(error = %e, "failed to persist offline queue");
            }
        }
    }
}

fn sort_drain_order(actions: &mut [PendingAction]) {
    actions.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

// ============================================================================
// Tests
// ============================================================================
