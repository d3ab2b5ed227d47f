//! Worker process loader.
//!
//! Specialization hands us the function app directory. The worker to run is
//! described by `<dir>/worker.config.json`:
//!
//! ```json
//! {
//!   "description": {
//!     "defaultExecutablePath": "dotnet",
//!     "defaultWorkerPath": "MyApp.dll",
//!     "arguments": ["--no-banner"]
//!   }
//! }
//! ```
//!
//! The child exchanges envelopes with the bridge over stdin/stdout using
//! 4-byte length-delimited frames.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::Envelope;
use crate::bridge::codec::FrameCodec;
use crate::worker::{WorkerBoundary, WorkerError, WorkerSink};

pub const WORKER_CONFIG_FILE: &str = "worker.config.json";

/// Set on the worker so it knows it runs behind the native bridge.
pub const NATIVE_HOST_ENV_VAR: &str = "AZURE_FUNCTIONS_NATIVE_HOST";

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to read worker config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid worker config {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker already started")]
    AlreadyStarted,
    #[error("{0}")]
    Other(String),
}

/// Resolves and starts the worker runtime for an application directory.
#[async_trait]
pub trait AppLoader: Send + Sync + 'static {
    async fn start(&self, app_dir: &Path) -> Result<(), LoaderError>;
}

#[derive(Debug, Deserialize)]
struct WorkerConfigFile {
    description: WorkerDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerDescription {
    default_executable_path: Option<String>,
    default_worker_path: Option<String>,
    #[serde(default)]
    arguments: Vec<String>,
}

/// Fully resolved worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl WorkerCommand {
    /// Read `worker.config.json` from `app_dir`.
    pub async fn resolve(app_dir: &Path) -> Result<Self, LoaderError> {
        let path = app_dir.join(WORKER_CONFIG_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| LoaderError::ConfigRead {
                path: path.clone(),
                source,
            })?;
        Self::from_config(app_dir, &path, &raw)
    }

    fn from_config(app_dir: &Path, path: &Path, raw: &str) -> Result<Self, LoaderError> {
        let invalid = |message: String| LoaderError::InvalidConfig {
            path: path.to_path_buf(),
            message,
        };

        let config: WorkerConfigFile =
            serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        let description = config.description;

        let executable = description
            .default_executable_path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| invalid("description.defaultExecutablePath is required".to_string()))?;

        let mut args: Vec<OsString> = description
            .arguments
            .into_iter()
            .map(OsString::from)
            .collect();
        if let Some(worker_path) = description
            .default_worker_path
            .filter(|p| !p.trim().is_empty())
        {
            args.push(resolve_in(app_dir, &worker_path).into_os_string());
        }

        Ok(Self {
            program: resolve_in(app_dir, &executable),
            args,
            working_dir: app_dir.to_path_buf(),
        })
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env(NATIVE_HOST_ENV_VAR, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

fn resolve_in(app_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        app_dir.join(path)
    }
}

/// Sink feeding the worker's stdin writer task.
struct PipeSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerSink for PipeSink {
    fn deliver(&self, envelope: Envelope) -> Result<(), WorkerError> {
        self.tx.send(envelope).map_err(|_| WorkerError::Disconnected)
    }
}

/// Starts the worker as a child process and wires it to the boundary.
pub struct ProcessLoader {
    boundary: WorkerBoundary,
    max_frame_length: usize,
    child: Mutex<Option<Child>>,
}

impl ProcessLoader {
    pub fn new(boundary: WorkerBoundary, max_frame_length: usize) -> Self {
        Self {
            boundary,
            max_frame_length,
            child: Mutex::new(None),
        }
    }

    /// Kill the worker if one is running.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill worker");
            }
        }
    }

    fn attach(&self, stdin: ChildStdin, stdout: ChildStdout) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let mut writer = FramedWrite::new(stdin, FrameCodec::new(self.max_frame_length));
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = writer.send(envelope).await {
                    tracing::error!(error = %e, "Failed to write to worker stdin");
                    break;
                }
            }
            tracing::debug!("Worker writer task exiting");
        });

        let emitter = self.boundary.register(Arc::new(PipeSink { tx }));

        let mut reader = FramedRead::new(stdout, FrameCodec::new(self.max_frame_length));
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(envelope) => {
                        if let Err(e) = emitter.emit(envelope) {
                            tracing::warn!(error = %e, "Dropping worker output");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read frame from worker");
                        break;
                    }
                }
            }
            tracing::info!("Worker stdout closed");
        });
    }
}

#[async_trait]
impl AppLoader for ProcessLoader {
    async fn start(&self, app_dir: &Path) -> Result<(), LoaderError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, "Previous worker exited, starting a new one");
                }
                Ok(None) => return Err(LoaderError::AlreadyStarted),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll running worker");
                    return Err(LoaderError::AlreadyStarted);
                }
            }
        }

        let command = WorkerCommand::resolve(app_dir).await?;
        tracing::info!(
            program = %command.program.display(),
            args = ?command.args,
            app_dir = %app_dir.display(),
            "Starting worker"
        );

        let mut child = command.to_command().spawn().map_err(LoaderError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoaderError::Spawn(io::Error::other("worker stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoaderError::Spawn(io::Error::other("worker stdout not piped")))?;

        tracing::debug!(pid = ?child.id(), "Worker spawned");
        self.attach(stdin, stdout);
        *slot = Some(child);
        Ok(())
    }
}
