//! Optimistic Mutation Applier.
//!
//! Every mutation goes through the same four steps:
//!
//! 1. compute the new local value from current state (no I/O);
//! 2. apply it to the container, keeping the exact prior snapshot;
//! 3. offline: hand the write to the [`OfflineQueue`] and return;
//! 4. online: send it, then reconcile with the authoritative answer, or
//!    restore the snapshot if the service refuses.
//!
//! Identical concurrent mutations are collapsed by the [`Deduplicator`]: a
//! double-tap on "like" produces one toggle and both callers see its outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::dedup::Deduplicator;
use crate::engine::events::{DiscardReason, EngineEvent, RollbackReason};
use crate::error::{Result, SyncError};
use crate::queue::{EnqueueOptions, OfflineQueue, Reconciliation};
use crate::remote::{Connectivity, RemoteError, RemoteMutation, RemoteService, WriteAck};
use crate::state::{Containers, EventEmitter};
use crate::types::{
    CollectionKey, Entity, EntityId, EntitySnapshot, LIKED_FIELD, LIKES_FIELD,
};

// ============================================================================
// Intent / outcome
// ============================================================================

/// A user-initiated change.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationIntent {
    /// Flip the viewer's like on an entity.
    ToggleLike {
        collection: CollectionKey,
        id: EntityId,
    },
    /// Add a new entity at the top of `collection`.
    Create {
        collection: CollectionKey,
        fields: Map<String, Value>,
    },
    /// Overwrite only the given fields (post edits, read flags).
    Edit {
        collection: CollectionKey,
        id: EntityId,
        patch: Map<String, Value>,
    },
    Remove {
        collection: CollectionKey,
        id: EntityId,
    },
}

impl MutationIntent {
    /// Key under which identical concurrent intents are collapsed.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::ToggleLike { id, .. } => format!("like:{id}"),
            Self::Create { collection, fields } => {
                format!("create:{collection}:{}", Value::Object(fields.clone()))
            }
            Self::Edit {
                collection,
                id,
                patch,
            } => format!("edit:{collection}:{id}:{}", Value::Object(patch.clone())),
            Self::Remove { collection, id } => format!("remove:{collection}:{id}"),
        }
    }

    pub fn collection(&self) -> &CollectionKey {
        match self {
            Self::ToggleLike { collection, .. }
            | Self::Create { collection, .. }
            | Self::Edit { collection, .. }
            | Self::Remove { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The service accepted the write. Carries the reconciled entity, if any
    /// survives locally.
    Applied(Option<Entity>),
    /// Kept optimistically and handed to the offline queue.
    Queued {
        action_id: u64,
        entity: Option<Entity>,
    },
    /// The optimistic change was reverted to its snapshot.
    RolledBack(RollbackReason),
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack(_))
    }

    /// The local entity after the mutation, when there is one.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Self::Applied(entity) | Self::Queued { entity, .. } => entity.as_ref(),
            Self::RolledBack(_) => None,
        }
    }
}

/// A mutation after its local half has run.
struct Prepared {
    mutation: RemoteMutation,
    snapshot: EntitySnapshot,
    local: Option<Entity>,
}

// ============================================================================
// OptimisticApplier
// ============================================================================

pub struct OptimisticApplier {
    remote: Arc<dyn RemoteService>,
    state: Arc<Containers>,
    queue: Arc<OfflineQueue>,
    connectivity: Connectivity,
    events: Arc<EventEmitter<EngineEvent>>,
    dedup: Deduplicator<MutationOutcome>,
    mutation_timeout: Duration,
    window: usize,
}

impl OptimisticApplier {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        state: Arc<Containers>,
        queue: Arc<OfflineQueue>,
        connectivity: Connectivity,
        events: Arc<EventEmitter<EngineEvent>>,
        mutation_timeout: Duration,
        window: usize,
    ) -> Self {
        Self {
            remote,
            state,
            queue,
            connectivity,
            events,
            dedup: Deduplicator::new(),
            mutation_timeout,
            window,
        }
    }

    /// Apply `intent` optimistically and settle it against the service.
    ///
    /// Returns `Err` only when the intent cannot be applied locally at all
    /// (e.g. the target is not loaded). Remote failures are reported through
    /// [`MutationOutcome::RolledBack`].
    pub async fn apply(&self, intent: MutationIntent) -> Result<MutationOutcome> {
        let key = intent.dedup_key();
        self.dedup.run(&key, || self.execute(intent)).await
    }

    pub fn is_in_flight(&self, intent: &MutationIntent) -> bool {
        self.dedup.is_in_flight(&intent.dedup_key())
    }

    pub(crate) fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub(crate) fn state(&self) -> &Containers {
        &self.state
    }

    pub(crate) fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.events.emit(&event);
    }

    async fn execute(&self, intent: MutationIntent) -> Result<MutationOutcome> {
        let prepared = self.apply_local(intent)?;
        let target = prepared.mutation.target().clone();

        // Writes against a placeholder wait behind its create.
        if target.is_temp() && !matches!(prepared.mutation, RemoteMutation::Create { .. }) {
            if matches!(prepared.mutation, RemoteMutation::Remove { .. })
                && self.queue.has_unsent_create(&target)
            {
                self.cancel_dependents(&target);
                tracing::debug!(id = %target, "removed unsent placeholder locally");
                return Ok(MutationOutcome::Applied(None));
            }
            return Ok(self.enqueue(prepared));
        }

        if !self.connectivity.is_online() {
            return Ok(self.enqueue(prepared));
        }

        let settled = self
            .dispatch(&prepared.mutation)
            .await
            .and_then(|ack| self.reconcile(&prepared.mutation, ack));
        match settled {
            Ok(entity) => Ok(MutationOutcome::Applied(entity.or(prepared.local))),
            Err(e) if e.is_transient() && !self.connectivity.is_online() => {
                tracing::debug!(
                    id = %target,
                    error = %e,
                    "connection lost mid-write; queueing"
                );
                Ok(self.enqueue(prepared))
            }
            Err(e) => {
                let reason = RollbackReason::from_error(e);
                self.rollback(&prepared.snapshot, reason.clone());
                if let RemoteMutation::Create { temp_id, .. } = &prepared.mutation {
                    self.cancel_dependents(temp_id);
                }
                Ok(MutationOutcome::RolledBack(reason))
            }
        }
    }

    /// Drop writes queued behind a placeholder that will never be created.
    pub(crate) fn cancel_dependents(&self, temp_id: &EntityId) {
        for action in self.queue.cancel_for_temp(temp_id) {
            self.emit(EngineEvent::ActionDiscarded {
                action,
                reason: DiscardReason::Cancelled,
            });
        }
    }

    /// Steps 1 and 2: compute and apply the local change.
    fn apply_local(&self, intent: MutationIntent) -> Result<Prepared> {
        match intent {
            MutationIntent::ToggleLike { collection, id } => {
                let container = self.state.for_key(&collection);
                let mut liked = false;
                let (snapshot, local) = container
                    .patch_with(&collection, &id, |current| {
                        liked = !current.flag(LIKED_FIELD);
                        let delta = if liked { 1 } else { -1 };
                        let likes = (current.counter(LIKES_FIELD) + delta).max(0);
                        let mut patch = Map::new();
                        patch.insert(LIKES_FIELD.to_string(), Value::from(likes));
                        patch.insert(LIKED_FIELD.to_string(), Value::Bool(liked));
                        patch
                    })
                    .ok_or_else(|| not_found(&collection, &id))?;
                Ok(Prepared {
                    mutation: RemoteMutation::ToggleLike {
                        collection,
                        id,
                        liked,
                    },
                    snapshot,
                    local: Some(local),
                })
            }
            MutationIntent::Create { collection, fields } => {
                let temp_id = EntityId::new_temp();
                let entity = Entity::new(temp_id.clone(), fields.clone());
                let snapshot = EntitySnapshot::Absent {
                    collection: collection.clone(),
                    id: temp_id.clone(),
                };
                self.state
                    .for_key(&collection)
                    .insert_front(&collection, entity.clone(), None);
                Ok(Prepared {
                    mutation: RemoteMutation::Create {
                        collection,
                        temp_id,
                        fields,
                    },
                    snapshot,
                    local: Some(entity),
                })
            }
            MutationIntent::Edit {
                collection,
                id,
                patch,
            } => {
                let (snapshot, local) = self
                    .state
                    .for_key(&collection)
                    .patch_with(&collection, &id, |_| patch.clone())
                    .ok_or_else(|| not_found(&collection, &id))?;
                Ok(Prepared {
                    mutation: RemoteMutation::Edit {
                        collection,
                        id,
                        patch,
                    },
                    snapshot,
                    local: Some(local),
                })
            }
            MutationIntent::Remove { collection, id } => {
                let (index, entity) = self
                    .state
                    .for_key(&collection)
                    .remove(&collection, &id)
                    .ok_or_else(|| not_found(&collection, &id))?;
                Ok(Prepared {
                    snapshot: EntitySnapshot::Present {
                        collection: collection.clone(),
                        index,
                        entity,
                    },
                    mutation: RemoteMutation::Remove { collection, id },
                    local: None,
                })
            }
        }
    }

    fn enqueue(&self, prepared: Prepared) -> MutationOutcome {
        let reconciliation = match &prepared.mutation {
            RemoteMutation::Create {
                collection,
                temp_id,
                ..
            } => Some(Reconciliation {
                temp_id: temp_id.clone(),
                collection: collection.clone(),
            }),
            _ => None,
        };
        let action_id = self.queue.enqueue(
            prepared.mutation,
            EnqueueOptions {
                priority: None,
                reconciliation,
                rollback: Some(prepared.snapshot),
            },
        );
        MutationOutcome::Queued {
            action_id,
            entity: prepared.local,
        }
    }

    /// Send a write, bounded by the mutation timeout.
    pub(crate) async fn dispatch(
        &self,
        mutation: &RemoteMutation,
    ) -> std::result::Result<WriteAck, RemoteError> {
        match tokio::time::timeout(self.mutation_timeout, self.remote.write(mutation)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout(self.mutation_timeout.as_millis() as u64)),
        }
    }

    /// Fold the service's answer into local state. Server values win over
    /// the optimistic guess. Returns the authoritative local entity.
    ///
    /// A create acknowledged without the assigned ID cannot be reconciled
    /// and is reported as a rejection; local state is left untouched.
    pub(crate) fn reconcile(
        &self,
        mutation: &RemoteMutation,
        ack: WriteAck,
    ) -> std::result::Result<Option<Entity>, RemoteError> {
        match mutation {
            RemoteMutation::Create {
                collection,
                temp_id,
                fields,
            } => {
                let entity = match ack {
                    WriteAck::Entity(entity) => entity,
                    WriteAck::Fields(returned) => entity_from_fields(fields, returned)?,
                    WriteAck::Accepted => return Err(missing_id()),
                };
                Ok(self.reconcile_created(collection, temp_id, entity))
            }
            RemoteMutation::ToggleLike { collection, id, .. }
            | RemoteMutation::Edit { collection, id, .. } => {
                let container = self.state.for_key(collection);
                Ok(match ack {
                    WriteAck::Entity(entity) => {
                        container.replace(collection, entity.clone());
                        Some(entity)
                    }
                    WriteAck::Fields(fields) => container.patch(collection, id, &fields),
                    WriteAck::Accepted => container.get(collection, id),
                })
            }
            RemoteMutation::Remove { .. } => Ok(None),
        }
    }

    fn reconcile_created(
        &self,
        collection: &CollectionKey,
        temp_id: &EntityId,
        entity: Entity,
    ) -> Option<Entity> {
        let touched = self.state.reconcile(temp_id, &entity);
        if touched.is_empty() && self.queue.has_queued_remove(temp_id) {
            // Deleted while the create was in flight; the queued remove
            // follows the new ID.
            tracing::debug!(
                temp_id = %temp_id,
                id = %entity.id,
                "created entity already removed locally"
            );
        } else if touched.is_empty() {
            tracing::warn!(
                collection = %collection,
                temp_id = %temp_id,
                id = %entity.id,
                "placeholder not found; inserting acknowledged entity as new"
            );
            self.state
                .for_key(collection)
                .insert_front(collection, entity.clone(), Some(self.window));
            self.emit(EngineEvent::ReconciliationMissed {
                collection: collection.clone(),
                temp_id: temp_id.clone(),
                id: entity.id.clone(),
            });
        }
        self.queue.remap_id(temp_id, &entity.id);
        Some(entity)
    }

    /// Restore `snapshot` exactly and report why.
    pub(crate) fn rollback(&self, snapshot: &EntitySnapshot, reason: RollbackReason) {
        let collection = snapshot.collection();
        tracing::warn!(
            collection = %collection,
            id = %snapshot.id(),
            error = %reason.error(),
            "rolling back optimistic mutation"
        );
        self.state.for_key(collection).restore(snapshot);
        self.emit(EngineEvent::MutationRolledBack {
            collection: collection.clone(),
            id: snapshot.id().clone(),
            reason,
        });
    }
}

fn not_found(collection: &CollectionKey, id: &EntityId) -> SyncError {
    SyncError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

/// Build the created entity from a fields-only acknowledgement. The service
/// must return at least the assigned `id`.
fn entity_from_fields(
    sent: &Map<String, Value>,
    mut returned: Map<String, Value>,
) -> std::result::Result<Entity, RemoteError> {
    let id = match returned.remove("id") {
        Some(Value::String(id)) => EntityId::stable(id),
        Some(Value::Number(n)) => EntityId::stable(n.to_string()),
        _ => return Err(missing_id()),
    };
    let mut entity = Entity::new(id, sent.clone());
    entity.patch(&returned);
    Ok(entity)
}

fn missing_id() -> RemoteError {
    RemoteError::rejected("create acknowledged without an assigned id")
}
