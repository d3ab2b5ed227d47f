//! Message router - decides whether an inbound message is answered locally
//! or forwarded to the worker.
//!
//! Before specialization the router decodes each envelope and answers the
//! bootstrap requests itself. The environment reload request loads the
//! worker and flips the router into specialized mode, after which every
//! envelope is forwarded undecoded to the inbound queue. The flip happens
//! once and is never undone.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;

use crate::bridge::Envelope;
use crate::bridge::protocol::{
    Content, FunctionEnvironmentReloadRequest, StatusResult, StreamingMessage,
};
use crate::loader::{AppLoader, LoaderError};
use crate::queue::QueuePair;
use crate::version::WORKER_VERSION;

/// Variable pointing the worker at the function app it should serve.
pub const SCRIPT_ROOT_ENV_VAR: &str = "AzureWebJobsScriptRoot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterMode {
    /// No worker loaded yet; bootstrap requests are answered locally.
    Generic = 0,
    /// Worker loaded; everything is forwarded.
    Specialized = 1,
}

impl RouterMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Generic,
            _ => Self::Specialized,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid environment variable name {0:?}")]
    InvalidEnvName(String),
    #[error("invalid value for environment variable {0}")]
    InvalidEnvValue(String),
    #[error("reload request has no function app directory")]
    MissingAppDirectory,
    #[error("failed to start worker: {0}")]
    Loader(#[from] LoaderError),
}

/// Destination for environment variables carried by the reload request.
pub trait EnvironmentWriter: Send + Sync + 'static {
    fn set(&self, key: &str, value: &str) -> Result<(), RouterError>;
}

/// Writes to the real process environment.
pub struct ProcessEnvironment;

impl EnvironmentWriter for ProcessEnvironment {
    fn set(&self, key: &str, value: &str) -> Result<(), RouterError> {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(RouterError::InvalidEnvName(key.to_string()));
        }
        if value.contains('\0') {
            return Err(RouterError::InvalidEnvValue(key.to_string()));
        }
        // SAFETY: no other thread reads the environment while this runs. clap
        // and the log filter read it before the stream starts, writes are
        // serialized by the generic-mode lock, and the host launches the
        // bridge with a numeric address so a channel reconnect never calls
        // getaddrinfo.
        unsafe { std::env::set_var(key, value) };
        Ok(())
    }
}

pub struct MessageRouter {
    mode: AtomicU8,
    /// Serializes generic-mode handling so specialization happens once.
    generic: Mutex<()>,
    queues: Arc<QueuePair>,
    loader: Arc<dyn AppLoader>,
    environment: Arc<dyn EnvironmentWriter>,
}

impl MessageRouter {
    pub fn new(
        queues: Arc<QueuePair>,
        loader: Arc<dyn AppLoader>,
        environment: Arc<dyn EnvironmentWriter>,
    ) -> Self {
        Self {
            mode: AtomicU8::new(RouterMode::Generic as u8),
            generic: Mutex::new(()),
            queues,
            loader,
            environment,
        }
    }

    pub fn mode(&self) -> RouterMode {
        RouterMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn is_specialized(&self) -> bool {
        self.mode() == RouterMode::Specialized
    }

    /// Route one envelope received from the host.
    pub async fn route(&self, envelope: Envelope) {
        if self.is_specialized() {
            self.forward(envelope);
            return;
        }

        let _generic = self.generic.lock().await;
        // Another routing call may have specialized while we waited.
        if self.is_specialized() {
            self.forward(envelope);
            return;
        }

        let message = match StreamingMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, len = envelope.len(), "Dropping undecodable message");
                return;
            }
        };

        let kind = message.kind();
        tracing::debug!(
            content_kind = %kind,
            request_id = %message.request_id,
            "New message received"
        );

        let response = match message.content {
            Some(Content::WorkerInitRequest(request)) => {
                tracing::info!(host_version = %request.host_version, "Worker init request");
                StreamingMessage::worker_init_response(WORKER_VERSION)
            }
            Some(Content::FunctionsMetadataRequest(_)) => {
                StreamingMessage::function_metadata_response()
            }
            Some(Content::WorkerWarmupRequest(_)) => {
                tracing::debug!("Worker warmup request");
                StreamingMessage::worker_warmup_response()
            }
            Some(Content::FunctionEnvironmentReloadRequest(request)) => {
                self.specialize(&message.request_id, request).await;
                return;
            }
            _ => {
                tracing::warn!(
                    content_kind = %kind,
                    request_id = %message.request_id,
                    "Dropping message received before specialization"
                );
                return;
            }
        };

        self.reply(response.with_request_id(message.request_id));
    }

    async fn specialize(&self, request_id: &str, request: FunctionEnvironmentReloadRequest) {
        tracing::info!(
            app_dir = %request.function_app_directory,
            env_vars = request.environment_variables.len(),
            "Specialization request received"
        );

        match self.load_worker(request).await {
            Ok(()) => {
                self.reply(
                    StreamingMessage::function_environment_reload_response(
                        StatusResult::success(),
                    )
                    .with_request_id(request_id),
                );
                self.mode
                    .store(RouterMode::Specialized as u8, Ordering::Release);
                tracing::info!("Specialization complete, forwarding all messages to worker");
            }
            Err(e) => {
                tracing::error!(error = %e, "Specialization failed, staying in generic mode");
                self.reply(
                    StreamingMessage::function_environment_reload_response(
                        StatusResult::failure(e.to_string()),
                    )
                    .with_request_id(request_id),
                );
            }
        }
    }

    async fn load_worker(
        &self,
        request: FunctionEnvironmentReloadRequest,
    ) -> Result<(), RouterError> {
        if request.function_app_directory.is_empty() {
            return Err(RouterError::MissingAppDirectory);
        }

        for (key, value) in &request.environment_variables {
            self.environment.set(key, value)?;
        }
        self.environment
            .set(SCRIPT_ROOT_ENV_VAR, &request.function_app_directory)?;

        let app_dir = PathBuf::from(&request.function_app_directory);
        self.loader.start(&app_dir).await?;
        Ok(())
    }

    fn reply(&self, message: StreamingMessage) {
        let kind = message.kind();
        match self.queues.outbound.push(message.to_envelope()) {
            Ok(()) => tracing::debug!(content_kind = %kind, "Pushed response to outbound queue"),
            Err(e) => tracing::warn!(content_kind = %kind, error = %e, "Failed to queue response"),
        }
    }

    fn forward(&self, envelope: Envelope) {
        tracing::trace!(len = envelope.len(), "Forwarding message to inbound queue");
        if let Err(e) = self.queues.inbound.push(envelope) {
            tracing::warn!(error = %e, "Failed to forward message to worker");
        }
    }
}
