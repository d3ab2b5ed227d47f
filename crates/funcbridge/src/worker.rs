//! Worker boundary - the hand-off point between the bridge and the worker runtime.
//!
//! The worker registers a [`WorkerSink`] once it is able to accept messages.
//! Until then, [`WorkerBoundary::deliver`] waits (optionally bounded by a
//! timeout) instead of dropping inbound envelopes. Once a wait has timed out,
//! later deliveries fail immediately until a sink is registered. Messages
//! travelling the other way go through a [`WorkerEmitter`], which pushes onto
//! the outbound queue and may be cloned into any number of worker-side tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::bridge::Envelope;
use crate::queue::{QueueError, QueuePair};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker registered within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("worker channel closed")]
    Disconnected,
}

/// Receiving side of the worker runtime.
///
/// Implementations must return promptly: they are called from the inbound
/// pump and a slow sink stalls every message behind it.
pub trait WorkerSink: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope) -> Result<(), WorkerError>;
}

/// Handle the worker uses to send messages to the host.
#[derive(Clone)]
pub struct WorkerEmitter {
    queues: Arc<QueuePair>,
}

impl WorkerEmitter {
    pub fn emit(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.queues.outbound.push(envelope)
    }
}

type SinkSlot = Option<Arc<dyn WorkerSink>>;

#[derive(Clone)]
pub struct WorkerBoundary {
    sink: Arc<watch::Sender<SinkSlot>>,
    queues: Arc<QueuePair>,
    registration_timeout: Option<Duration>,
    timed_out: Arc<AtomicBool>,
}

impl WorkerBoundary {
    /// `registration_timeout` of `None` waits for registration forever.
    pub fn new(queues: Arc<QueuePair>, registration_timeout: Option<Duration>) -> Self {
        let (sink, _) = watch::channel(None);
        Self {
            sink: Arc::new(sink),
            queues,
            registration_timeout,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the worker's sink and release any pending deliveries.
    pub fn register(&self, sink: Arc<dyn WorkerSink>) -> WorkerEmitter {
        let previous = self.sink.send_replace(Some(sink));
        self.timed_out.store(false, Ordering::SeqCst);
        if previous.is_some() {
            tracing::warn!("Worker sink replaced by a second registration");
        } else {
            tracing::info!("Worker registered");
        }
        self.emitter()
    }

    pub fn is_registered(&self) -> bool {
        self.sink.borrow().is_some()
    }

    pub fn emitter(&self) -> WorkerEmitter {
        WorkerEmitter {
            queues: Arc::clone(&self.queues),
        }
    }

    /// Hand one envelope to the worker, waiting for registration first.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), WorkerError> {
        let sink = self.registered_sink().await?;
        sink.deliver(envelope)
    }

    async fn registered_sink(&self) -> Result<Arc<dyn WorkerSink>, WorkerError> {
        if let Some(sink) = self.sink.borrow().as_ref() {
            return Ok(Arc::clone(sink));
        }
        if let Some(timeout) = self.registration_timeout {
            if self.timed_out.load(Ordering::SeqCst) {
                return Err(WorkerError::RegistrationTimeout(timeout));
            }
        }

        tracing::debug!("Waiting for worker registration");
        let mut rx = self.sink.subscribe();
        let wait = async {
            let slot = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| WorkerError::Disconnected)?;
            slot.as_ref().map(Arc::clone).ok_or(WorkerError::Disconnected)
        };

        match self.registration_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                self.timed_out.store(true, Ordering::SeqCst);
                WorkerError::RegistrationTimeout(timeout)
            })?,
            None => wait.await,
        }
    }
}
