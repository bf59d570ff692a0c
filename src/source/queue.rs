//! Notification hand-off between an OPC UA backend and its session
//!
//! Backends push notifications from callbacks that must not block, so the
//! queue is bounded and drops on overflow, counting what it dropped. Session
//! loss is a separate signal; notifications received before the loss are
//! still handed out first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::SourceError;
use crate::value::ValueChangeEvent;

/// Producer side, cloned into backend callbacks
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<ValueChangeEvent>,
    lost: Arc<watch::Sender<Option<String>>>,
    dropped: Arc<AtomicU64>,
}

impl NotificationSender {
    /// Queue a notification; returns false when it was dropped
    pub fn push(&self, event: ValueChangeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Mark the session as gone; the first reason wins
    pub fn lose(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.lost.send_if_modified(|lost| {
            if lost.is_some() {
                return false;
            }
            *lost = Some(reason);
            true
        });
    }
}

/// Consumer side, owned by the session
#[derive(Debug)]
pub struct NotificationQueue {
    rx: mpsc::Receiver<ValueChangeEvent>,
    lost: watch::Receiver<Option<String>>,
    dropped: Arc<AtomicU64>,
}

impl NotificationQueue {
    pub fn bounded(capacity: usize) -> (NotificationSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (lost_tx, lost_rx) = watch::channel(None);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            NotificationSender {
                tx,
                lost: Arc::new(lost_tx),
                dropped: dropped.clone(),
            },
            Self {
                rx,
                lost: lost_rx,
                dropped,
            },
        )
    }

    /// Next notification; `SessionLost` only once everything queued is out
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Result<ValueChangeEvent, SourceError> {
        if let Ok(event) = self.rx.try_recv() {
            return Ok(event);
        }
        if let Some(reason) = self.lost.borrow().clone() {
            return Err(SourceError::SessionLost(reason));
        }

        tokio::select! {
            biased;
            event = self.rx.recv() => event.ok_or_else(|| {
                SourceError::SessionLost("notification channel closed".to_string())
            }),
            changed = self.lost.changed() => {
                // Anything that raced in with the loss still goes out first
                if let Ok(event) = self.rx.try_recv() {
                    return Ok(event);
                }
                let reason = match changed {
                    Ok(()) => self.lost.borrow().clone(),
                    Err(_) => None,
                };
                Err(SourceError::SessionLost(
                    reason.unwrap_or_else(|| "session ended".to_string()),
                ))
            }
        }
    }

    /// Notifications dropped since the last call
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NodeId;
    use crate::value::{Quality, Value};
    use pretty_assertions::assert_eq;

    fn event(v: i64) -> ValueChangeEvent {
        ValueChangeEvent {
            node_id: NodeId::numeric(2, 1),
            value: Value::Integer(v),
            source_timestamp: None,
            server_timestamp: None,
            quality: Quality::good(),
        }
    }

    #[tokio::test]
    async fn queued_notifications_are_delivered_before_loss() {
        let (tx, mut queue) = NotificationQueue::bounded(8);
        tx.push(event(1));
        tx.push(event(2));
        tx.lose("connection lost");
        tx.lose("session closed by server");

        assert_eq!(queue.next().await, Ok(event(1)));
        assert_eq!(queue.next().await, Ok(event(2)));
        assert_eq!(
            queue.next().await,
            Err(SourceError::SessionLost("connection lost".to_string()))
        );
    }

    #[tokio::test]
    async fn loss_wakes_a_waiting_consumer() {
        let (tx, mut queue) = NotificationQueue::bounded(8);
        let waiter = tokio::spawn(async move { queue.next().await });
        tokio::task::yield_now().await;

        tx.lose("connection lost");
        assert_eq!(
            waiter.await.unwrap(),
            Err(SourceError::SessionLost("connection lost".to_string()))
        );
    }

    #[test]
    fn overflow_is_counted() {
        let (tx, queue) = NotificationQueue::bounded(2);
        assert!(tx.push(event(1)));
        assert!(tx.push(event(2)));
        assert!(!tx.push(event(3)));
        assert!(!tx.push(event(4)));

        assert_eq!(queue.take_dropped(), 2);
        assert_eq!(queue.take_dropped(), 0);
    }
}
