//! funcbridge: native gRPC bridge between a functions host and a locally
//! hosted worker runtime.

pub mod bridge;
pub mod config;
pub mod loader;
pub mod queue;
pub mod router;
pub mod service;
pub mod stream;
pub mod transport;
mod version;
pub mod worker;

pub use bridge::Envelope;
pub use config::{BridgeConfig, Cli, StartupOptions};
pub use loader::{AppLoader, LoaderError, ProcessLoader};
pub use queue::{MessageQueue, QueueError, QueuePair};
pub use router::{MessageRouter, RouterError, RouterMode};
pub use service::{Bridge, BridgeError, BridgeParts};
pub use stream::{Duplex, ReadOutcome, StreamEngine, StreamState, StreamStatus};
pub use version::{BRIDGE_VERSION, VersionInfo, WORKER_VERSION};
pub use worker::{WorkerBoundary, WorkerEmitter, WorkerError, WorkerSink};
