//! Duplex stream engine.
//!
//! Owns the single long-lived stream to the host. Writes are admitted
//! through a one-slot gate: whoever flips `write_in_progress` from false to
//! true pops the head of the pending buffer and performs the physical write;
//! everyone else just appends. Completion of a write clears the flag and
//! fires the next one, so writes reach the transport in enqueue order with
//! at most one in flight.
//!
//! The read side is a loop that hands every envelope to the routing channel
//! and immediately reads again. The first failed read ends the stream.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tonic::Code;

use crate::bridge::Envelope;
use crate::bridge::protocol::StreamingMessage;

/// Terminal status of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub code: Code,
    pub message: String,
}

impl StreamStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<tonic::Status> for StreamStatus {
    fn from(status: tonic::Status) -> Self {
        Self::new(status.code(), status.message())
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

pub enum ReadOutcome {
    Message(Envelope),
    /// The stream ended; no further reads will succeed.
    Closed(StreamStatus),
}

/// Transport underneath the engine.
///
/// The engine never issues two concurrent writes or two concurrent reads.
#[async_trait]
pub trait Duplex: Send + Sync + 'static {
    /// Returns false if the envelope could not be written.
    async fn write(&self, envelope: Envelope) -> bool;
    async fn read(&self) -> ReadOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Connecting = 0,
    Active = 1,
    Terminating = 2,
    Done = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Terminating,
            _ => Self::Done,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream is {0:?}, writes are no longer accepted")]
    NotWritable(StreamState),
}

struct Inner {
    duplex: Arc<dyn Duplex>,
    state: AtomicU8,
    write_in_progress: AtomicBool,
    pending: Mutex<VecDeque<Envelope>>,
    routing: mpsc::UnboundedSender<Envelope>,
    done: watch::Sender<Option<StreamStatus>>,
}

#[derive(Clone)]
pub struct StreamEngine {
    inner: Arc<Inner>,
}

impl StreamEngine {
    /// Start the engine over `duplex`.
    ///
    /// The start-stream handshake carrying `worker_id` is the first write.
    /// Every envelope read from the host is sent to `routing`.
    pub fn start(
        duplex: Arc<dyn Duplex>,
        worker_id: &str,
        routing: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let (done, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            duplex,
            state: AtomicU8::new(StreamState::Connecting as u8),
            write_in_progress: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            routing,
            done,
        });

        tracing::debug!(worker_id, "Sending start stream");
        inner.enqueue(StreamingMessage::start_stream(worker_id).to_envelope());
        inner.fire_write();

        tokio::spawn(read_loop(Arc::clone(&inner)));
        inner.set_state(StreamState::Active);

        Self { inner }
    }

    /// Queue an envelope for the host.
    pub fn write(&self, envelope: Envelope) -> Result<(), StreamError> {
        match self.state() {
            state @ (StreamState::Terminating | StreamState::Done) => {
                Err(StreamError::NotWritable(state))
            }
            _ => {
                self.inner.enqueue(envelope);
                self.inner.fire_write();
                Ok(())
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    /// Resolve with the terminal status once the stream ends.
    pub async fn wait(&self) -> StreamStatus {
        let mut rx = self.inner.done.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => status
                .clone()
                .unwrap_or_else(|| StreamStatus::new(Code::Unknown, "missing terminal status")),
            Err(_) => StreamStatus::new(Code::Unknown, "stream engine dropped"),
        }
    }
}

impl Inner {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        // Only ever moves forward; a late Active never overwrites Done.
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, envelope: Envelope) {
        self.pending().push_back(envelope);
    }

    fn fire_write(self: &Arc<Self>) {
        if self
            .write_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let next = self.pending().pop_front();
        let Some(envelope) = next else {
            self.write_in_progress.store(false, Ordering::Release);
            // An enqueue may have lost the gate to us after we found the buffer empty.
            if !self.pending().is_empty() {
                self.fire_write();
            }
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ok = inner.duplex.write(envelope).await;
            inner.on_write_done(ok);
        });
    }

    fn on_write_done(self: &Arc<Self>, ok: bool) {
        if !self.write_in_progress.swap(false, Ordering::AcqRel) {
            tracing::warn!("Write completed while no write was in progress");
        }
        if !ok {
            tracing::warn!(state = ?self.state(), "Failed to write message to host");
        }
        self.fire_write();
    }

    fn on_read_done(&self, envelope: Envelope) {
        tracing::trace!(len = envelope.len(), "Received message from host");
        if self.routing.send(envelope).is_err() {
            tracing::warn!("Routing channel closed, dropping message from host");
        }
    }

    fn on_done(&self, status: StreamStatus) {
        self.set_state(StreamState::Terminating);
        if status.is_ok() {
            tracing::info!("Stream to host closed");
        } else {
            tracing::error!(status = %status, "Stream to host failed");
        }

        let recorded = self.done.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        });
        if !recorded {
            tracing::debug!("Terminal status already recorded");
        }
        self.set_state(StreamState::Done);
    }
}

async fn read_loop(inner: Arc<Inner>) {
    loop {
        match inner.duplex.read().await {
            ReadOutcome::Message(envelope) => inner.on_read_done(envelope),
            ReadOutcome::Closed(status) => {
                inner.on_done(status);
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    /// In-memory duplex. The test drives the host side through [`MemoryHost`].
    pub(crate) struct MemoryDuplex {
        to_host: mpsc::UnboundedSender<Envelope>,
        from_host: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReadOutcome>>,
        write_delay: Duration,
        fail_writes: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        writes: AtomicUsize,
    }

    pub(crate) struct MemoryHost {
        pub received: mpsc::UnboundedReceiver<Envelope>,
        to_bridge: mpsc::UnboundedSender<ReadOutcome>,
    }

    impl MemoryHost {
        pub(crate) fn send(&self, envelope: Envelope) {
            let _ = self.to_bridge.send(ReadOutcome::Message(envelope));
        }

        pub(crate) fn close(&self, status: StreamStatus) {
            let _ = self.to_bridge.send(ReadOutcome::Closed(status));
        }

        pub(crate) async fn recv(&mut self) -> Envelope {
            tokio::time::timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("timed out waiting for bridge")
                .expect("bridge side dropped")
        }
    }

    impl MemoryDuplex {
        pub(crate) fn pair(write_delay: Duration) -> (Arc<Self>, MemoryHost) {
            let (to_host, received) = mpsc::unbounded_channel();
            let (to_bridge, from_host) = mpsc::unbounded_channel();
            let duplex = Arc::new(Self {
                to_host,
                from_host: tokio::sync::Mutex::new(from_host),
                write_delay,
                fail_writes: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            });
            (duplex, MemoryHost { received, to_bridge })
        }

        pub(crate) fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Duplex for MemoryDuplex {
        async fn write(&self, envelope: Envelope) -> bool {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            let ok =
                !self.fail_writes.load(Ordering::SeqCst) && self.to_host.send(envelope).is_ok();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ok
        }

        async fn read(&self) -> ReadOutcome {
            match self.from_host.lock().await.recv().await {
                Some(outcome) => outcome,
                None => ReadOutcome::Closed(StreamStatus::ok()),
            }
        }
    }

    fn start(
        write_delay: Duration,
    ) -> (
        StreamEngine,
        Arc<MemoryDuplex>,
        MemoryHost,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (duplex, host) = MemoryDuplex::pair(write_delay);
        let (routing_tx, routing_rx) = mpsc::unbounded_channel();
        let engine = StreamEngine::start(duplex.clone(), "worker-1", routing_tx);
        (engine, duplex, host, routing_rx)
    }

    #[tokio::test]
    async fn start_stream_is_first_write() {
        let (engine, _duplex, mut host, _routing) = start(Duration::ZERO);
        engine.write(Envelope::from(vec![1u8])).unwrap();

        let first = StreamingMessage::from_envelope(&host.recv().await).unwrap();
        assert_eq!(first, StreamingMessage::start_stream("worker-1"));
        assert_eq!(host.recv().await.as_bytes(), &[1]);
        assert_eq!(engine.state(), StreamState::Active);
    }

    #[tokio::test]
    async fn writes_are_fifo_with_one_in_flight() {
        let (engine, duplex, mut host, _routing) = start(Duration::from_millis(1));
        for i in 0..50u8 {
            engine.write(Envelope::from(vec![i])).unwrap();
        }

        host.recv().await; // start stream
        for i in 0..50u8 {
            assert_eq!(host.recv().await.as_bytes(), &[i]);
        }
        assert_eq!(duplex.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_never_overlap() {
        let (engine, duplex, mut host, _routing) = start(Duration::ZERO);
        let mut writers = Vec::new();
        for w in 0..4u8 {
            let engine = engine.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..25u8 {
                    engine.write(Envelope::from(vec![w, i])).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        host.recv().await;
        let mut last_seen = [None::<u8>; 4];
        for _ in 0..100 {
            let envelope = host.recv().await;
            let (w, i) = (envelope.as_bytes()[0] as usize, envelope.as_bytes()[1]);
            assert!(last_seen[w].is_none_or(|prev| prev < i));
            last_seen[w] = Some(i);
        }
        assert_eq!(duplex.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn failed_write_does_not_stall_later_writes() {
        let (engine, duplex, mut host, _routing) = start(Duration::ZERO);
        host.recv().await;

        duplex.fail_writes.store(true, Ordering::SeqCst);
        engine.write(Envelope::from(vec![1u8])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        duplex.fail_writes.store(false, Ordering::SeqCst);

        engine.write(Envelope::from(vec![2u8])).unwrap();
        assert_eq!(host.recv().await.as_bytes(), &[2]);
        assert_eq!(duplex.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stray_completion_still_drains_pending_writes() {
        let (engine, duplex, mut host, _routing) = start(Duration::ZERO);
        host.recv().await;
        while engine.inner.write_in_progress.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        engine.inner.enqueue(Envelope::from(vec![9u8]));
        engine.inner.on_write_done(true);

        assert_eq!(host.recv().await.as_bytes(), &[9]);
        assert_eq!(duplex.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn reads_are_routed_in_order() {
        let (_engine, _duplex, host, mut routing) = start(Duration::ZERO);
        for i in 0..10u8 {
            host.send(Envelope::from(vec![i]));
        }
        for i in 0..10u8 {
            assert_eq!(routing.recv().await.unwrap().as_bytes(), &[i]);
        }
    }

    #[tokio::test]
    async fn clean_close_resolves_wait_with_ok() {
        let (engine, _duplex, host, _routing) = start(Duration::ZERO);
        host.close(StreamStatus::ok());

        let status = engine.wait().await;
        assert!(status.is_ok());
        assert_eq!(engine.state(), StreamState::Done);
    }

    #[tokio::test]
    async fn read_failure_ends_stream() {
        let (engine, _duplex, host, mut routing) = start(Duration::ZERO);
        host.send(Envelope::from(vec![1u8]));
        host.close(StreamStatus::new(Code::Unavailable, "host went away"));
        // never read: the loop stopped at the failure
        host.send(Envelope::from(vec![2u8]));

        let status = engine.wait().await;
        assert_eq!(status.code, Code::Unavailable);
        assert_eq!(status.to_string(), "Unavailable: host went away");
        assert_eq!(routing.recv().await.unwrap().as_bytes(), &[1]);
        assert!(routing.try_recv().is_err());
    }

    #[tokio::test]
    async fn writes_rejected_after_done() {
        let (engine, _duplex, host, _routing) = start(Duration::ZERO);
        host.close(StreamStatus::ok());
        engine.wait().await;

        assert!(matches!(
            engine.write(Envelope::from(vec![1u8])),
            Err(StreamError::NotWritable(StreamState::Done))
        ));
    }

    #[tokio::test]
    async fn wait_can_be_called_by_many() {
        let (engine, _duplex, host, _routing) = start(Duration::ZERO);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.wait().await })
            })
            .collect();
        host.close(StreamStatus::new(Code::Cancelled, "shutdown"));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().code, Code::Cancelled);
        }
    }

    #[test]
    fn status_from_tonic() {
        let status: StreamStatus = tonic::Status::unavailable("connection refused").into();
        assert_eq!(
            status,
            StreamStatus::new(Code::Unavailable, "connection refused")
        );
        assert_eq!(StreamStatus::ok().to_string(), "Ok");
    }
}
