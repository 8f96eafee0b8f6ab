//! Hand-off structures shared by the three tasks
//!
//! - `PositionQueue` - bounded, overwrite-oldest queue of GPS fixes
//!   (GPS feed -> controller)
//! - `JourneyContext` - the queue plus the "recovering" flag, built once and
//!   shared by `Arc` among all tasks
//! - `SignalSender` / `SignalReceiver` - user-id FIFO and Start/Stop signals
//!   (card signal -> controller)
//!
//! Every structure has exactly one producer and one consumer.

use crate::domain::types::{CardId, PositionSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Notify};

/// Resolve once shutdown has been requested (or its sender is gone)
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

/// Bounded queue that drops its oldest fix instead of blocking the producer
pub struct PositionQueue {
    capacity: usize,
    slots: Mutex<VecDeque<PositionSample>>,
    available: Notify,
}

impl PositionQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, slots: Mutex::new(VecDeque::with_capacity(capacity)), available: Notify::new() }
    }

    /// Publish a fix. Returns true if an unread fix was overwritten.
    pub fn push(&self, sample: PositionSample) -> bool {
        let overwritten = {
            let mut slots = self.slots.lock();
            let overwritten = if slots.len() >= self.capacity {
                slots.pop_front();
                true
            } else {
                false
            };
            slots.push_back(sample);
            overwritten
        };
        self.available.notify_one();
        overwritten
    }

    pub fn try_pop(&self) -> Option<PositionSample> {
        self.slots.lock().pop_front()
    }

    /// Wait for the next fix
    pub async fn pop(&self) -> PositionSample {
        loop {
            if let Some(sample) = self.try_pop() {
                return sample;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// State shared by reference among the GPS feed, card signal and controller
pub struct JourneyContext {
    positions: PositionQueue,
    /// Set by the controller while it resumes an interrupted route; the next
    /// card read ends that route instead of starting a new one.
    recovering: AtomicBool,
}

impl JourneyContext {
    pub fn new(position_capacity: usize) -> Self {
        Self { positions: PositionQueue::new(position_capacity), recovering: AtomicBool::new(false) }
    }

    pub fn positions(&self) -> &PositionQueue {
        &self.positions
    }

    pub fn set_recovering(&self) {
        self.recovering.store(true, Ordering::SeqCst);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set
    pub fn take_recovering(&self) -> bool {
        self.recovering.swap(false, Ordering::SeqCst)
    }
}

/// Card-signal side of the signal channels
#[derive(Debug, Clone)]
pub struct SignalSender {
    user_ids: mpsc::UnboundedSender<CardId>,
    start: mpsc::UnboundedSender<()>,
    stop: mpsc::UnboundedSender<()>,
}

impl SignalSender {
    /// Queue the user id, then raise Start. The id is always enqueued first
    /// so the controller never sees a Start without one.
    pub fn start(&self, user_id: CardId) -> bool {
        self.user_ids.send(user_id).is_ok() && self.start.send(()).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.stop.send(()).is_ok()
    }
}

/// Controller side of the signal channels
#[derive(Debug)]
pub struct SignalReceiver {
    user_ids: mpsc::UnboundedReceiver<CardId>,
    start: mpsc::UnboundedReceiver<()>,
    stop: mpsc::UnboundedReceiver<()>,
}

impl SignalReceiver {
    /// Wait for Start and return the user id queued with it.
    /// `None` once the card signal side has gone away.
    pub async fn wait_start(&mut self) -> Option<CardId> {
        self.start.recv().await?;
        self.user_ids.recv().await
    }

    /// Wait for Stop. `None` once the card signal side has gone away.
    pub async fn wait_stop(&mut self) -> Option<()> {
        self.stop.recv().await
    }
}

/// Create the signal channel pair
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (user_ids_tx, user_ids_rx) = mpsc::unbounded_channel();
    let (start_tx, start_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = mpsc::unbounded_channel();
    (
        SignalSender { user_ids: user_ids_tx, start: start_tx, stop: stop_tx },
        SignalReceiver { user_ids: user_ids_rx, start: start_rx, stop: stop_rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn sample(secs: u32) -> PositionSample {
        PositionSample::new(Utc.with_ymd_and_hms(2021, 3, 4, 12, 0, secs).unwrap(), 45.0, 25.0)
    }

    #[test]
    fn test_queue_overwrites_oldest() {
        let queue = PositionQueue::new(2);
        assert!(!queue.push(sample(1)));
        assert!(!queue.push(sample(2)));
        assert!(queue.push(sample(3)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(sample(2)));
        assert_eq!(queue.try_pop(), Some(sample(3)));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_capacity_at_least_one() {
        let queue = PositionQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(sample(1));
        assert!(queue.push(sample(2)));
        assert_eq!(queue.try_pop(), Some(sample(2)));
    }

    #[tokio::test]
    async fn test_pop_waits_for_publish() {
        let queue = Arc::new(PositionQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.push(sample(7));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(got, sample(7));
    }

    #[test]
    fn test_recovering_flag() {
        let ctx = JourneyContext::new(2);
        assert!(!ctx.is_recovering());
        ctx.set_recovering();
        assert!(ctx.is_recovering());
        assert!(ctx.take_recovering());
        assert!(!ctx.take_recovering());
    }

    #[tokio::test]
    async fn test_start_carries_user_id() {
        let (tx, mut rx) = signal_channel();
        let card = CardId::parse("780870559455").unwrap();
        assert!(tx.start(card.clone()));
        assert!(tx.stop());

        assert_eq!(rx.wait_start().await, Some(card));
        assert_eq!(rx.wait_stop().await, Some(()));

        drop(tx);
        assert_eq!(rx.wait_start().await, None);
        assert_eq!(rx.wait_stop().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
