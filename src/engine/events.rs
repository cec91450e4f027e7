//! Signals the engine emits for the UI layer: rollbacks, queue outcomes,
//! subscription status and connectivity transitions.

use crate::error::RemoteError;
use crate::queue::{DrainReport, PendingAction};
use crate::realtime::SubscriptionStatus;
use crate::types::{CollectionKey, EntityId};

/// Why an optimistic mutation was reverted.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    /// The call failed for a retryable reason while the device still looked
    /// online. The caller may retry or queue it.
    Transient(RemoteError),
    /// The service refused the write. Never retried automatically.
    Rejected(RemoteError),
}

impl RollbackReason {
    pub fn from_error(error: RemoteError) -> Self {
        if error.is_transient() {
            Self::Transient(error)
        } else {
            Self::Rejected(error)
        }
    }

    pub fn error(&self) -> &RemoteError {
        match self {
            Self::Transient(e) | Self::Rejected(e) => e,
        }
    }
}

/// Why a queued action was dropped without being applied.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    Rejected(RemoteError),
    /// Failed `attempts` times in a row.
    Exhausted {
        attempts: u32,
        last_error: RemoteError,
    },
    /// Sat in the queue longer than the maximum age.
    Expired,
    /// Its placeholder was deleted (or its create discarded) before it could
    /// be sent.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MutationRolledBack {
        collection: CollectionKey,
        id: EntityId,
        reason: RollbackReason,
    },
    ActionApplied {
        action_id: u64,
        action_type: &'static str,
        collection: CollectionKey,
        id: EntityId,
    },
    /// Dropped from the queue. Its rollback snapshot has been restored,
    /// except for `Cancelled` actions whose placeholder is already gone.
    ActionDiscarded {
        action: PendingAction,
        reason: DiscardReason,
    },
    DrainFinished(DrainReport),
    SubscriptionStatusChanged {
        resource: CollectionKey,
        status: SubscriptionStatus,
        reconnect_attempts: u32,
    },
    ConnectivityChanged {
        online: bool,
    },
    /// A queued create was acknowledged but its placeholder was gone; the
    /// authoritative entity was inserted as new.
    ReconciliationMissed {
        collection: CollectionKey,
        temp_id: EntityId,
        id: EntityId,
    },
}
