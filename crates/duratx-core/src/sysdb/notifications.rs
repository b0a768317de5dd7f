// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process wake-ups for recv, get_event, and result waiters.
//!
//! A single dedicated connection LISTENs on one channel; the two insert
//! triggers publish to it with a payload prefix that tells message and
//! event wake-ups apart. Each incoming payload is dispatched to in-memory
//! waiters registered under the same key. Wakes may be spurious; waiters
//! always re-read the database before concluding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The single channel both insert triggers publish to. Payloads carry an
/// `n::` or `e::` prefix naming the originating table.
pub(crate) const NOTIFICATIONS_CHANNEL: &str = "dbos_notifications_channel";

/// Build the dispatcher key for a message queue waiter.
pub(crate) fn notification_key(destination_uuid: &str, topic: &str) -> String {
    format!("n::{}::{}", destination_uuid, topic)
}

/// Build the dispatcher key for an event waiter.
pub(crate) fn event_key(workflow_uuid: &str, key: &str) -> String {
    format!("e::{}::{}", workflow_uuid, key)
}

/// Build the dispatcher key for a terminal-status waiter.
pub(crate) fn status_key(workflow_uuid: &str) -> String {
    format!("s::{}", workflow_uuid)
}

/// Process-local map of waiters keyed by `"<kind>::<uuid>::<topic-or-key>"`.
///
/// Each waiter owns its own [`Notify`] so a wake delivered between the
/// registration and the await is retained as a permit rather than lost.
#[derive(Default)]
pub(crate) struct NotificationDispatcher {
    waiters: Mutex<HashMap<String, Vec<Arc<Notify>>>>,
}

impl NotificationDispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter under `key`. The waiter is removed when the guard
    /// drops, on wake or timeout alike.
    pub(crate) fn register(self: &Arc<Self>, key: &str) -> WaiterGuard {
        let notify = Arc::new(Notify::new());
        self.waiters
            .lock()
            .expect("dispatcher mutex poisoned")
            .entry(key.to_string())
            .or_default()
            .push(notify.clone());
        WaiterGuard {
            dispatcher: self.clone(),
            key: key.to_string(),
            notify,
        }
    }

    /// Wake every waiter registered under `key`.
    pub(crate) fn notify(&self, key: &str) {
        let waiters = self.waiters.lock().expect("dispatcher mutex poisoned");
        if let Some(list) = waiters.get(key) {
            for notify in list {
                notify.notify_one();
            }
        }
    }
}

/// A registered waiter. Dropping it deregisters the entry.
pub(crate) struct WaiterGuard {
    dispatcher: Arc<NotificationDispatcher>,
    key: String,
    notify: Arc<Notify>,
}

impl WaiterGuard {
    /// Wait for a wake or until `timeout` elapses. Returns true on wake.
    pub(crate) async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self
            .dispatcher
            .waiters
            .lock()
            .expect("dispatcher mutex poisoned");
        if let Some(list) = waiters.get_mut(&self.key) {
            list.retain(|n| !Arc::ptr_eq(n, &self.notify));
            if list.is_empty() {
                waiters.remove(&self.key);
            }
        }
    }
}

/// Run the LISTEN loop until cancelled.
///
/// Payloads are `"n::<uuid>::<topic>"` from the notifications trigger and
/// `"e::<uuid>::<key>"` from the events trigger, and already match the
/// waiter-key format. Connection drops are retried with a short delay;
/// waiters tolerate the missed wakes because they re-read the database on
/// their poll fallback.
pub(crate) async fn run_listener(
    pool: PgPool,
    dispatcher: Arc<NotificationDispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Notification listener failed to connect, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };
        if let Err(e) = listener.listen(NOTIFICATIONS_CHANNEL).await {
            warn!(error = %e, "LISTEN failed, retrying");
            continue;
        }
        debug!("Notification listener connected");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Notification listener stopped");
                    return;
                }

                received = listener.recv() => {
                    match received {
                        Ok(notification) => {
                            let payload = notification.payload();
                            if payload.starts_with("n::") || payload.starts_with("e::") {
                                dispatcher.notify(payload);
                            } else {
                                debug!(payload, "Ignoring unknown payload");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Notification listener lost connection, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wake_before_wait_is_retained() {
        let dispatcher = NotificationDispatcher::new();
        let waiter = dispatcher.register("n::w1::topic");
        dispatcher.notify("n::w1::topic");
        assert!(waiter.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_timeout_without_wake() {
        let dispatcher = NotificationDispatcher::new();
        let waiter = dispatcher.register("n::w1::topic");
        dispatcher.notify("n::other::topic");
        assert!(!waiter.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_guard_drop_deregisters() {
        let dispatcher = NotificationDispatcher::new();
        {
            let _waiter = dispatcher.register("e::w1::k");
            assert_eq!(dispatcher.waiters.lock().unwrap().len(), 1);
        }
        assert!(dispatcher.waiters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_waiters_same_key() {
        let dispatcher = NotificationDispatcher::new();
        let first = dispatcher.register("s::w1");
        let second = dispatcher.register("s::w1");
        dispatcher.notify("s::w1");
        assert!(first.wait_timeout(Duration::from_millis(10)).await);
        assert!(second.wait_timeout(Duration::from_millis(10)).await);
    }
}
