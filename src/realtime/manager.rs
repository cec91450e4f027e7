//! SubscriptionManager — one change-feed subscription per resource, kept
//! alive with capped exponential backoff.
//!
//! Each subscription is a spawned task driving this state machine:
//!
//! ```text
//! Idle -> Connecting -> Subscribed
//!         ^              | error / timeout / close
//!         |              v
//!         +--(delay)-- Reconnecting
//! ```
//!
//! `reconnect_attempts` grows on every failed or timed-out connect and
//! resets on a confirmed `Subscribed`. Events are forwarded to the merge
//! loop; errors only ever surface as status transitions.
//!
//! Unsubscribing aborts the task, which drops the channel and any pending
//! backoff sleep. `Closed` is terminal: a later subscribe builds a fresh
//! handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::events::EngineEvent;
use crate::remote::{ChangeFeed, ChannelMessage, RemoteError};
use crate::state::EventEmitter;
use crate::types::CollectionKey;

use super::backoff::reconnect_delay;
use super::merge::MergeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Idle,
    Connecting,
    Subscribed,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Name of the open channel, while subscribed.
    pub channel: Option<String>,
    pub status: SubscriptionStatus,
    pub reconnect_attempts: u32,
}

impl SubscriptionState {
    fn idle() -> Self {
        Self {
            channel: None,
            status: SubscriptionStatus::Idle,
            reconnect_attempts: 0,
        }
    }
}

struct Handle {
    state: Arc<watch::Sender<SubscriptionState>>,
    task: JoinHandle<()>,
}

/// Everything a subscription task needs, shared across tasks.
struct TaskContext {
    feed: Arc<dyn ChangeFeed>,
    merge: MergeHandle,
    events: Arc<EventEmitter<EngineEvent>>,
    backoff_base: Duration,
    backoff_max: Duration,
    connect_timeout: Duration,
}

pub struct SubscriptionManager {
    ctx: Arc<TaskContext>,
    handles: Mutex<HashMap<CollectionKey, Handle>>,
}

impl SubscriptionManager {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        merge: MergeHandle,
        events: Arc<EventEmitter<EngineEvent>>,
        backoff_base: Duration,
        backoff_max: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(TaskContext {
                feed,
                merge,
                events,
                backoff_base,
                backoff_max,
                connect_timeout,
            }),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start a subscription for `resource`. Returns `false` (and does
    /// nothing) when a live one already exists.
    pub fn subscribe(&self, resource: &CollectionKey) -> bool {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(resource) {
            if !existing.task.is_finished() {
                return false;
            }
        }

        let (state, _) = watch::channel(SubscriptionState::idle());
        let state = Arc::new(state);
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.ctx),
            resource.clone(),
            Arc::clone(&state),
        ));
        handles.insert(resource.clone(), Handle { state, task });
        tracing::debug!(collection = %resource, "subscription started");
        true
    }

    /// Tear down the subscription for `resource`. Returns its final state,
    /// or `None` if there was none.
    pub fn unsubscribe(&self, resource: &CollectionKey) -> Option<SubscriptionState> {
        let handle = self.handles.lock().remove(resource)?;
        handle.task.abort();
        let attempts = handle.state.borrow().reconnect_attempts;
        set_status(
            &self.ctx,
            resource,
            &handle.state,
            SubscriptionStatus::Closed,
            None,
            attempts,
        );
        tracing::debug!(collection = %resource, "subscription closed");
        let closed = handle.state.borrow().clone();
        Some(closed)
    }

    pub fn unsubscribe_all(&self) {
        let resources: Vec<CollectionKey> = self.handles.lock().keys().cloned().collect();
        for resource in resources {
            self.unsubscribe(&resource);
        }
    }

    pub fn state(&self, resource: &CollectionKey) -> Option<SubscriptionState> {
        self.handles
            .lock()
            .get(resource)
            .map(|h| h.state.borrow().clone())
    }

    /// Watch the state of a subscription. The receiver keeps reporting after
    /// an unsubscribe, ending on `Closed`.
    pub fn watch(&self, resource: &CollectionKey) -> Option<watch::Receiver<SubscriptionState>> {
        self.handles.lock().get(resource).map(|h| h.state.subscribe())
    }

    pub fn resources(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self.handles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (_, handle) in self.handles.get_mut().drain() {
            handle.task.abort();
        }
    }
}

// ============================================================================
// Subscription task
// ============================================================================

async fn run_subscription(
    ctx: Arc<TaskContext>,
    resource: CollectionKey,
    state: Arc<watch::Sender<SubscriptionState>>,
) {
    let mut attempts: u32 = 0;
    let mut has_subscribed = false;

    loop {
        set_status(&ctx, &resource, &state, SubscriptionStatus::Connecting, None, attempts);

        let connect = ctx.feed.subscribe(&resource);
        let connected = match tokio::time::timeout(ctx.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout(ctx.connect_timeout.as_millis() as u64)),
        };
        match connected {
            Ok(mut channel) => {
                attempts = 0;
                set_status(
                    &ctx,
                    &resource,
                    &state,
                    SubscriptionStatus::Subscribed,
                    Some(channel.name.clone()),
                    attempts,
                );
                if has_subscribed && !ctx.merge.invalidate(resource.clone()).await {
                    return;
                }
                has_subscribed = true;

                let reason = loop {
                    match channel.messages.recv().await {
                        Some(ChannelMessage::Event(event)) => {
                            if !ctx.merge.apply(resource.clone(), event).await {
                                tracing::debug!(collection = %resource, "merge loop gone; ending subscription");
                                return;
                            }
                        }
                        Some(ChannelMessage::Error(message)) => break format!("channel error: {message}"),
                        Some(ChannelMessage::Timeout) => break "channel timed out".to_string(),
                        Some(ChannelMessage::Closed) | None => break "channel closed".to_string(),
                    }
                };
                tracing::warn!(collection = %resource, channel = %channel.name, %reason, "subscription lost");
            }
            Err(e) => {
                attempts = attempts.saturating_add(1);
                tracing::warn!(collection = %resource, attempts, error = %e, "subscribe failed");
            }
        }

        set_status(&ctx, &resource, &state, SubscriptionStatus::Reconnecting, None, attempts);
        let delay = reconnect_delay(attempts, ctx.backoff_base, ctx.backoff_max);
        tracing::debug!(collection = %resource, attempts, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}

/// Publish a transition. Never overwrites `Closed`.
fn set_status(
    ctx: &TaskContext,
    resource: &CollectionKey,
    state: &watch::Sender<SubscriptionState>,
    status: SubscriptionStatus,
    channel: Option<String>,
    reconnect_attempts: u32,
) {
    let changed = state.send_if_modified(|current| {
        if current.status == SubscriptionStatus::Closed {
            return false;
        }
        let next = SubscriptionState {
            channel,
            status,
            reconnect_attempts,
        };
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        tracing::debug!(collection = %resource, ?status, reconnect_attempts, "subscription status changed");
        ctx.events.emit(&EngineEvent::SubscriptionStatusChanged {
            resource: resource.clone(),
            status,
            reconnect_attempts,
        });
    }
}
