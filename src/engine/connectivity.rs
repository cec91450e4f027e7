use std::sync::Weak;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::events::EngineEvent;
use super::EngineInner;

/// Watch the connectivity signal and start one drain pass per
/// offline → online transition.
///
/// Holds only a weak reference so a dropped engine ends the task.
pub(super) fn spawn_connectivity_watcher(
    engine: Weak<EngineInner>,
    mut rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // Read before spawning: a transition that lands before the task is first
    // polled must still be seen as a change.
    let mut was_online = *rx.borrow_and_update();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if online == was_online {
                continue;
            }
            was_online = online;

            let Some(inner) = engine.upgrade() else {
                break;
            };
            if inner.is_disposed() {
                break;
            }
            tracing::info!(online, "connectivity changed");
            inner.emit(EngineEvent::ConnectivityChanged { online });
            if online {
                // Spawned so transitions keep being observed during a pass.
                tokio::spawn(async move {
                    if let Err(e) = inner.drain().await {
                        tracing::debug!(error = %e, "drain after reconnect did not run");
                    }
                });
            }
        }
    })
}
