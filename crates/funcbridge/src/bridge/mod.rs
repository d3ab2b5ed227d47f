//! Wire types shared by the host stream and the worker pipes.
//!
//! # Architecture
//!
//! - **envelope**: Opaque serialized message as it travels through queues
//! - **protocol**: Decoded `StreamingMessage` subset the bridge answers itself
//! - **codec**: Length-delimited framing for the worker stdin/stdout pipes

pub mod codec;
pub mod envelope;
pub mod protocol;

pub use envelope::Envelope;
