//! Fixed-capacity ring of tunnel log lines with live fan-out.
//!
//! Producers never block: every appended line is offered to each subscriber
//! with `try_send`, and a subscriber whose channel is full simply misses it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Default number of lines kept in memory
pub const DEFAULT_CAPACITY: usize = 1000;

/// Per-subscriber channel depth
const SUBSCRIBER_QUEUE: usize = 100;

/// Identifier handed out by [`RingLogBuffer::subscribe`]
pub type SubscriberId = u64;

/// Live view of lines appended after subscription.
#[derive(Debug)]
pub struct LogSubscription {
    id: SubscriberId,
    rx: mpsc::Receiver<String>,
}

impl LogSubscription {
    /// Handle for [`RingLogBuffer::unsubscribe`]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next line. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Take a line if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

struct Inner {
    lines: VecDeque<String>,
    subscribers: Vec<(SubscriberId, mpsc::Sender<String>)>,
    next_id: SubscriberId,
}

/// Thread-safe circular buffer of log lines.
pub struct RingLogBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl RingLogBuffer {
    /// Buffer holding at most `capacity` lines (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Maximum number of retained lines
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line, evicting the oldest one when full, and fan it out.
    pub fn append(&self, line: impl Into<String>) {
        let line = line.into();
        let mut inner = self.lock();

        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.clone());

        // A closed receiver means the subscription handle was dropped.
        inner.subscribers.retain(|(_, tx)| {
            !matches!(
                tx.try_send(line.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    /// Last `k` lines in chronological order.
    pub fn snapshot(&self, k: usize) -> Vec<String> {
        let inner = self.lock();
        let n = k.min(inner.lines.len());
        inner
            .lines
            .iter()
            .skip(inner.lines.len() - n)
            .cloned()
            .collect()
    }

    /// Drop all retained lines; subscribers stay attached
    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    /// Number of retained lines
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive every line appended from now on
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, tx));
        LogSubscription { id, rx }
    }

    /// Drop the subscriber's sender, which closes its channel.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().subscribers.retain(|(sub, _)| *sub != id);
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for RingLogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot_in_order() {
        let buf = RingLogBuffer::new(5);
        buf.append("line1");
        buf.append("line2");
        buf.append("line3");

        assert_eq!(buf.snapshot(3), vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn overflow_keeps_most_recent_lines() {
        let buf = RingLogBuffer::new(3);
        for line in ["a", "b", "c", "d", "e"] {
            buf.append(line);
        }

        assert_eq!(buf.snapshot(3), vec!["c", "d", "e"]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn snapshot_larger_than_contents() {
        let buf = RingLogBuffer::new(10);
        buf.append("only");

        assert_eq!(buf.snapshot(5), vec!["only"]);
    }

    #[test]
    fn snapshot_zero_is_empty() {
        let buf = RingLogBuffer::new(5);
        buf.append("line");

        assert!(buf.snapshot(0).is_empty());
    }

    #[test]
    fn snapshot_of_tail_only() {
        let buf = RingLogBuffer::new(4);
        for line in ["a", "b", "c", "d", "e", "f"] {
            buf.append(line);
        }

        assert_eq!(buf.snapshot(2), vec!["e", "f"]);
    }

    #[test]
    fn clear_resets_size() {
        let buf = RingLogBuffer::new(5);
        buf.append("line1");
        buf.append("line2");
        buf.clear();

        assert!(buf.is_empty());
        assert!(buf.snapshot(5).is_empty());

        buf.append("again");
        assert_eq!(buf.snapshot(5), vec!["again"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf = RingLogBuffer::new(0);
        buf.append("x");
        buf.append("y");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(10), vec!["y"]);
    }

    #[tokio::test]
    async fn subscribers_receive_new_lines() {
        let buf = RingLogBuffer::new(10);
        buf.append("before");
        let mut sub = buf.subscribe();
        buf.append("hello");

        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_drops_instead_of_blocking() {
        let buf = RingLogBuffer::new(10);
        let mut sub = buf.subscribe();

        for i in 0..(SUBSCRIBER_QUEUE + 50) {
            buf.append(format!("line {i}"));
        }

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE);
        // the ring itself still holds the newest lines
        assert_eq!(buf.snapshot(1), vec![format!("line {}", SUBSCRIBER_QUEUE + 49)]);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let buf = RingLogBuffer::new(10);
        let mut sub = buf.subscribe();
        assert_eq!(buf.subscriber_count(), 1);

        buf.unsubscribe(sub.id());
        buf.append("after");

        assert_eq!(buf.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let buf = RingLogBuffer::new(10);
        let sub = buf.subscribe();
        drop(sub);

        buf.append("line");
        assert_eq!(buf.subscriber_count(), 0);
    }
}
