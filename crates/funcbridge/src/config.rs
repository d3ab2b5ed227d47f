//! Startup options and bridge configuration.

use std::time::Duration;

use clap::{Args, Parser};

/// Default maximum gRPC message length (`i32::MAX`, as the host sends it).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = i32::MAX as usize;

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Options the host passes on the command line when it launches the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct StartupOptions {
    /// Host address of the functions host's gRPC server.
    #[arg(long)]
    pub host: String,

    /// Port of the functions host's gRPC server.
    #[arg(long)]
    pub port: u16,

    /// Full URI of the host; overrides --host/--port when given.
    #[arg(long = "functions-uri")]
    pub uri: Option<String>,

    /// Identifier sent in the start-stream handshake.
    #[arg(long = "workerId", alias = "functions-worker-id")]
    pub worker_id: String,

    #[arg(long = "requestId", alias = "functions-request-id")]
    pub request_id: Option<String>,

    /// Applied to both sent and received messages.
    #[arg(
        long = "grpcMaxMessageLength",
        alias = "functions-grpc-max-message-length",
        default_value_t = DEFAULT_MAX_MESSAGE_LENGTH
    )]
    pub max_message_length: usize,
}

impl StartupOptions {
    /// Endpoint of the host's gRPC server.
    pub fn endpoint(&self) -> String {
        match &self.uri {
            Some(uri) => uri.clone(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

// The host passes each option under both its legacy and `--functions-*`
// spelling; a repeated option overrides the earlier occurrence.
#[derive(Debug, Parser)]
#[command(
    name = "funcbridge",
    version,
    about = "Native gRPC bridge for functions workers",
    args_override_self = true
)]
pub struct Cli {
    #[command(flatten)]
    pub startup: StartupOptions,

    /// Seconds to wait for the worker to register before dropping a message
    /// bound for it. 0 waits forever.
    #[arg(
        long,
        env = "FUNCBRIDGE_REGISTRATION_TIMEOUT_SECS",
        default_value_t = DEFAULT_REGISTRATION_TIMEOUT.as_secs()
    )]
    pub registration_timeout_secs: u64,
}

impl Cli {
    pub fn bridge_config(&self) -> BridgeConfig {
        let timeout = match self.registration_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        BridgeConfig::new().with_registration_timeout(timeout)
    }
}

/// Tunables that are not part of the host's launch contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// `None` waits for worker registration forever.
    pub registration_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            registration_timeout: Some(DEFAULT_REGISTRATION_TIMEOUT),
        }
    }

    pub fn with_registration_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.registration_timeout = timeout;
        self
    }
}
