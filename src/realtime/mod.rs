//! Realtime Subscription Manager and the merge loop it feeds.

pub mod backoff;
pub mod manager;
pub mod merge;

pub use backoff::reconnect_delay;
pub use manager::{SubscriptionManager, SubscriptionState, SubscriptionStatus};
pub use merge::{merge_event, spawn_merge_loop, MergeCommand, MergeEffect, MergeHandle};
