//! Transports the stream engine runs over.
//!
//! Currently provides the gRPC client transport to the host via tonic.

pub mod grpc;

pub use grpc::{GrpcDuplex, TransportError};
