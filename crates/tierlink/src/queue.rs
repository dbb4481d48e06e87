// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordered hand-off of backplane messages and handle removals to the manager.
//!
//! Observer callbacks run on whatever thread the backplane or handle uses, so
//! they only enqueue. A single drain at a time processes the queue, which keeps
//! notifications in receipt order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tierlink_handle::{BackplaneMessage, RemovalEvent};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notification {
    Backplane(BackplaneMessage),
    Removal { level: usize, event: RemovalEvent },
}

#[derive(Debug, Default)]
pub(crate) struct NotificationQueue {
    pending: Mutex<VecDeque<Notification>>,
    ready: Notify,
    draining: tokio::sync::Mutex<()>,
}

impl NotificationQueue {
    pub(crate) fn push(&self, notification: Notification) {
        self.pending.lock().push_back(notification);
        self.ready.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Notification> {
        self.pending.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Waits until something was pushed since the last wake-up.
    pub(crate) async fn wait(&self) {
        self.ready.notified().await;
    }

    /// Serializes drains between the worker and inline callers.
    pub(crate) async fn lock_drain(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.draining.lock().await
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use tierlink_handle::{OriginId, RemovalReason};

    use super::*;

    #[test]
    fn preserves_receipt_order() {
        let queue = NotificationQueue::default();
        queue.push(Notification::Backplane(BackplaneMessage::clear(OriginId::from_bytes([1; 16]))));
        queue.push(Notification::Removal {
            level: 0,
            event: RemovalEvent::new("k", None, RemovalReason::Expired),
        });

        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pop(), Some(Notification::Backplane(_))));
        assert!(matches!(queue.pop(), Some(Notification::Removal { level: 0, .. })));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_before_wait_is_not_lost() {
        let queue = NotificationQueue::default();
        queue.push(Notification::Backplane(BackplaneMessage::clear(OriginId::from_bytes([1; 16]))));
        futures::executor::block_on(queue.wait());
    }
}
