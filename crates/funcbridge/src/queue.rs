//! Outbound/inbound message queues between the host stream and the worker.
//!
//! Each queue is unbounded, FIFO, multi-producer and single-consumer. Pushing
//! never waits; popping suspends until an entry arrives or the queue closes.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bridge::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0} queue is closed")]
    Closed(&'static str),
    #[error("{0} queue already has an active consumer")]
    ConcurrentConsumer(&'static str),
}

pub struct MessageQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: CancellationToken,
}

impl MessageQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, envelope: Envelope) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed(self.name));
        }
        // The receiver lives as long as `self`, so send only fails after drop.
        self.tx
            .send(envelope)
            .map_err(|_| QueueError::Closed(self.name))?;
        tracing::trace!(queue = self.name, "Pushed envelope");
        Ok(())
    }

    /// Wait for the next envelope.
    ///
    /// Returns `Ok(None)` once the queue is closed and every entry pushed
    /// before the close has been delivered.
    pub async fn pop(&self) -> Result<Option<Envelope>, QueueError> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| QueueError::ConcurrentConsumer(self.name))?;

        tokio::select! {
            biased;

            envelope = rx.recv() => Ok(envelope),
            _ = self.closed.cancelled() => Ok(None),
        }
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(queue = self.name, "Closing queue");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// The two queues connecting the stream engine, router and worker boundary.
pub struct QueuePair {
    /// Messages bound for the host.
    pub outbound: MessageQueue,
    /// Messages bound for the worker.
    pub inbound: MessageQueue,
}

impl QueuePair {
    pub fn new() -> Self {
        Self {
            outbound: MessageQueue::new("outbound"),
            inbound: MessageQueue::new("inbound"),
        }
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

impl Default for QueuePair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn envelope(byte: u8) -> Envelope {
        Envelope::from(vec![byte])
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = MessageQueue::new("test");
        for i in 0..10 {
            queue.push(envelope(i)).unwrap();
        }
        for i in 0..10 {
            let popped = queue.pop().await.unwrap().unwrap();
            assert_eq!(popped.as_bytes(), &[i]);
        }
    }

    #[tokio::test]
    async fn envelope_is_delivered_byte_for_byte() {
        let queue = MessageQueue::new("test");
        let payload: Vec<u8> = (0..=255).collect();
        queue.push(Envelope::from(payload.clone())).unwrap();
        let popped = queue.pop().await.unwrap().unwrap();
        assert_eq!(popped.as_bytes(), payload.as_slice());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(MessageQueue::new("test"));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        queue.push(envelope(1)).unwrap();
        let popped = popper.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.as_bytes(), &[1]);
    }

    #[tokio::test]
    async fn close_drains_then_reports_closed() {
        let queue = MessageQueue::new("test");
        queue.push(envelope(1)).unwrap();
        queue.push(envelope(2)).unwrap();
        queue.close();

        assert!(matches!(queue.push(envelope(3)), Err(QueueError::Closed("test"))));
        assert_eq!(queue.pop().await.unwrap().unwrap().as_bytes(), &[1]);
        assert_eq!(queue.pop().await.unwrap().unwrap().as_bytes(), &[2]);
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_popper() {
        let queue = Arc::new(MessageQueue::new("test"));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(popper.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let queue = Arc::new(MessageQueue::new("test"));
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = queue.pop().await;
        assert!(matches!(second, Err(QueueError::ConcurrentConsumer("test"))));

        queue.push(envelope(9)).unwrap();
        assert_eq!(first.await.unwrap().unwrap().unwrap().as_bytes(), &[9]);
    }

    #[tokio::test]
    async fn many_producers_one_consumer() {
        let queue = Arc::new(MessageQueue::new("test"));
        let mut producers = Vec::new();
        for p in 0..4u8 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..25u8 {
                    queue.push(Envelope::from(vec![p, i])).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut last_seen = [None::<u8>; 4];
        for _ in 0..100 {
            let popped = queue.pop().await.unwrap().unwrap();
            let (p, i) = (popped.as_bytes()[0] as usize, popped.as_bytes()[1]);
            // per-producer order is preserved
            assert!(last_seen[p].is_none_or(|prev| prev < i));
            last_seen[p] = Some(i);
        }
        assert!(last_seen.iter().all(|seen| *seen == Some(24)));
    }
}
