//! Merge loop — the single consumer that folds change-feed events into the
//! state containers.
//!
//! Every channel forwards into one bounded mpsc, so inbound events are
//! applied one at a time in delivery order. Each merge is one container
//! write, which cannot interleave with an applier-driven write on the same
//! collection.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::remote::RealtimeEvent;
use crate::state::Containers;
use crate::types::CollectionKey;

#[derive(Debug)]
pub enum MergeCommand {
    Apply {
        resource: CollectionKey,
        event: RealtimeEvent,
    },
    /// Events may have been missed; mark the page for refetch.
    Invalidate(CollectionKey),
    /// Acknowledged once every earlier command has been merged.
    Barrier(oneshot::Sender<()>),
}

/// What a single event did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Inserted,
    Patched,
    Removed,
    /// Redundant, or the collection is not loaded.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct MergeHandle {
    tx: mpsc::Sender<MergeCommand>,
}

impl MergeHandle {
    /// Queue an event. Returns `false` once the loop has stopped.
    pub async fn apply(&self, resource: CollectionKey, event: RealtimeEvent) -> bool {
        self.tx
            .send(MergeCommand::Apply { resource, event })
            .await
            .is_ok()
    }

    pub async fn invalidate(&self, resource: CollectionKey) -> bool {
        self.tx.send(MergeCommand::Invalidate(resource)).await.is_ok()
    }

    /// Wait until everything queued so far has been merged.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(MergeCommand::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the merge loop. It runs until every [`MergeHandle`] is dropped or
/// the returned task is aborted.
pub fn spawn_merge_loop(
    state: Arc<Containers>,
    window: usize,
    capacity: usize,
) -> (MergeHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                MergeCommand::Apply { resource, event } => {
                    let effect = merge_event(&state, &resource, event, window);
                    tracing::trace!(collection = %resource, ?effect, "merged realtime event");
                }
                MergeCommand::Invalidate(resource) => {
                    state.for_key(&resource).mark_stale(&resource);
                }
                MergeCommand::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!("merge loop stopped");
    });
    (MergeHandle { tx }, task)
}

/// Fold one event into `resource`. Redundant events (already applied
/// optimistically, or delivered twice) leave state unchanged.
pub fn merge_event(
    state: &Containers,
    resource: &CollectionKey,
    event: RealtimeEvent,
    window: usize,
) -> MergeEffect {
    let container = state.for_key(resource);
    match event {
        RealtimeEvent::Insert { entity } => {
            if container.page(resource).is_none() {
                return MergeEffect::Ignored;
            }
            if container.contains(resource, &entity.id) {
                // Full row for an entity we hold: overlay, never drop local fields.
                return match container.patch(resource, &entity.id, &entity.fields) {
                    Some(_) => MergeEffect::Patched,
                    None => MergeEffect::Ignored,
                };
            }
            if container.insert_front(resource, entity, Some(window)) {
                MergeEffect::Inserted
            } else {
                MergeEffect::Ignored
            }
        }
        RealtimeEvent::Update { id, fields } => match container.patch(resource, &id, &fields) {
            Some(_) => MergeEffect::Patched,
            None => MergeEffect::Ignored,
        },
        RealtimeEvent::Delete { id } => match container.remove(resource, &id) {
            Some(_) => MergeEffect::Removed,
            None => MergeEffect::Ignored,
        },
    }
}
