//! Bridge: wires the stream engine, router, queues and worker boundary.
//!
//! This owns:
//! - The stream engine over the host connection
//! - The routing task feeding host messages to the router in receive order
//! - The outbound pump (outbound queue -> engine writes)
//! - The inbound pump (inbound queue -> worker boundary)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::Envelope;
use crate::config::{BridgeConfig, StartupOptions};
use crate::loader::{AppLoader, ProcessLoader};
use crate::queue::QueuePair;
use crate::router::{EnvironmentWriter, MessageRouter, ProcessEnvironment};
use crate::stream::{Duplex, StreamEngine, StreamStatus};
use crate::transport::{GrpcDuplex, TransportError};
use crate::worker::WorkerBoundary;

/// How long the pumps get to notice closed queues before they are aborted.
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Components the bridge is assembled from.
pub struct BridgeParts {
    pub queues: Arc<QueuePair>,
    pub boundary: WorkerBoundary,
    pub loader: Arc<dyn AppLoader>,
    pub environment: Arc<dyn EnvironmentWriter>,
}

pub struct Bridge {
    engine: StreamEngine,
    router: Arc<MessageRouter>,
    queues: Arc<QueuePair>,
    boundary: WorkerBoundary,
    routing_task: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
    process: Option<Arc<ProcessLoader>>,
}

impl Bridge {
    /// Connect to the host and start relaying.
    pub async fn connect(
        options: &StartupOptions,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let queues = Arc::new(QueuePair::new());
        let boundary = WorkerBoundary::new(Arc::clone(&queues), config.registration_timeout);
        let process = Arc::new(ProcessLoader::new(
            boundary.clone(),
            options.max_message_length,
        ));

        let endpoint = options.endpoint();
        tracing::info!(
            %endpoint,
            worker_id = %options.worker_id,
            request_id = options.request_id.as_deref().unwrap_or(""),
            "Connecting to host"
        );
        let duplex = GrpcDuplex::connect(&endpoint, options.max_message_length).await?;

        let parts = BridgeParts {
            queues,
            boundary,
            loader: process.clone(),
            environment: Arc::new(ProcessEnvironment),
        };
        let mut bridge = Self::start(Arc::new(duplex), &options.worker_id, parts);
        bridge.process = Some(process);
        Ok(bridge)
    }

    /// Start relaying over an already established duplex.
    pub fn start(duplex: Arc<dyn Duplex>, worker_id: &str, parts: BridgeParts) -> Self {
        let BridgeParts {
            queues,
            boundary,
            loader,
            environment,
        } = parts;

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&queues),
            loader,
            environment,
        ));

        let (routing_tx, routing_rx) = mpsc::unbounded_channel();
        let engine = StreamEngine::start(duplex, worker_id, routing_tx);

        let routing_task = tokio::spawn(route_messages(routing_rx, Arc::clone(&router)));
        let pumps = vec![
            tokio::spawn(outbound_pump(Arc::clone(&queues), engine.clone())),
            tokio::spawn(inbound_pump(Arc::clone(&queues), boundary.clone())),
        ];

        Self {
            engine,
            router,
            queues,
            boundary,
            routing_task,
            pumps,
            process: None,
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn boundary(&self) -> &WorkerBoundary {
        &self.boundary
    }

    /// Wait for the stream to end, then stop the pumps and the worker.
    pub async fn wait(self) -> StreamStatus {
        let status = self.engine.wait().await;
        tracing::info!(status = %status, "Stream ended, shutting down bridge");

        self.queues.close();
        self.routing_task.abort();
        for pump in self.pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(PUMP_SHUTDOWN_GRACE, pump).await.is_err() {
                tracing::debug!("Pump did not exit in time, aborting");
                abort.abort();
            }
        }

        if let Some(process) = &self.process {
            process.shutdown().await;
        }
        status
    }
}

async fn route_messages(mut rx: mpsc::UnboundedReceiver<Envelope>, router: Arc<MessageRouter>) {
    while let Some(envelope) = rx.recv().await {
        router.route(envelope).await;
    }
}

async fn outbound_pump(queues: Arc<QueuePair>, engine: StreamEngine) {
    loop {
        match queues.outbound.pop().await {
            Ok(Some(envelope)) => {
                if let Err(e) = engine.write(envelope) {
                    tracing::warn!(error = %e, "Dropping message for host");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Outbound pump stopped");
                break;
            }
        }
    }
    tracing::debug!("Outbound pump exiting");
}

async fn inbound_pump(queues: Arc<QueuePair>, boundary: WorkerBoundary) {
    loop {
        match queues.inbound.pop().await {
            Ok(Some(envelope)) => {
                if let Err(e) = boundary.deliver(envelope).await {
                    tracing::warn!(error = %e, "Dropping message for worker");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Inbound pump stopped");
                break;
            }
        }
    }
    tracing::debug!("Inbound pump exiting");
}
