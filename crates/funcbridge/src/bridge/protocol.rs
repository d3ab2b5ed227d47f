//! Decoded subset of the host's `StreamingMessage` protocol.
//!
//! Only the messages the bridge answers or emits itself are modelled. Every
//! other `content` case (invocations, logs, function loads, ...) decodes as
//! [`ContentKind::Other`]; those are forwarded as raw envelopes and never
//! decoded at all once the worker is loaded.
//!
//! Field numbers match the host's `FunctionRpc.proto`.

use std::collections::HashMap;
use std::fmt;

use prost::Message;
use serde::Serialize;

use super::envelope::Envelope;

/// Fully-qualified name of the duplex streaming method on the host.
pub const EVENT_STREAM_PATH: &str = "/AzureFunctionsRpcMessages.FunctionRpc/EventStream";

/// Worker capability: user code exceptions are reported as such.
pub const CAPABILITY_ENABLE_USER_CODE_EXCEPTION: &str = "EnableUserCodeException";
/// Worker capability: warmup requests are answered.
pub const CAPABILITY_HANDLES_WORKER_WARMUP: &str = "HandlesWorkerWarmupMessage";

#[derive(Clone, PartialEq, Message)]
pub struct StreamingMessage {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(
        oneof = "streaming_message::Content",
        tags = "20, 17, 16, 29, 30, 25, 26, 33, 34"
    )]
    pub content: Option<streaming_message::Content>,
}

pub mod streaming_message {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Content {
        #[prost(message, tag = "20")]
        StartStream(super::StartStream),
        #[prost(message, tag = "17")]
        WorkerInitRequest(super::WorkerInitRequest),
        #[prost(message, tag = "16")]
        WorkerInitResponse(super::WorkerInitResponse),
        #[prost(message, tag = "29")]
        FunctionsMetadataRequest(super::FunctionsMetadataRequest),
        #[prost(message, tag = "30")]
        FunctionMetadataResponse(super::FunctionMetadataResponse),
        #[prost(message, tag = "25")]
        FunctionEnvironmentReloadRequest(super::FunctionEnvironmentReloadRequest),
        #[prost(message, tag = "26")]
        FunctionEnvironmentReloadResponse(super::FunctionEnvironmentReloadResponse),
        #[prost(message, tag = "33")]
        WorkerWarmupRequest(super::WorkerWarmupRequest),
        #[prost(message, tag = "34")]
        WorkerWarmupResponse(super::WorkerWarmupResponse),
    }
}

pub use streaming_message::Content;

#[derive(Clone, PartialEq, Message)]
pub struct StartStream {
    #[prost(string, tag = "2")]
    pub worker_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WorkerInitRequest {
    #[prost(string, tag = "1")]
    pub host_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub worker_directory: String,
    #[prost(string, tag = "5")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WorkerInitResponse {
    #[prost(string, tag = "1")]
    pub worker_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionsMetadataRequest {
    #[prost(string, tag = "1")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionMetadataResponse {
    #[prost(message, optional, tag = "2")]
    pub result: Option<StatusResult>,
    #[prost(bool, tag = "3")]
    pub use_default_metadata_indexing: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionEnvironmentReloadRequest {
    #[prost(map = "string, string", tag = "1")]
    pub environment_variables: HashMap<String, String>,
    #[prost(string, tag = "2")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FunctionEnvironmentReloadResponse {
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WorkerWarmupRequest {
    #[prost(string, tag = "1")]
    pub worker_directory: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WorkerWarmupResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusResult {
    #[prost(enumeration = "status_result::Status", tag = "4")]
    pub status: i32,
    #[prost(string, tag = "1")]
    pub result: String,
    #[prost(message, optional, tag = "2")]
    pub exception: Option<RpcException>,
}

pub mod status_result {
    use prost::Enumeration;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Failure = 0,
        Success = 1,
        Cancelled = 2,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct RpcException {
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(string, tag = "1")]
    pub stack_trace: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: status_result::Status::Success as i32,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: status_result::Status::Failure as i32,
            result: String::new(),
            exception: Some(RpcException {
                source: env!("CARGO_PKG_NAME").to_string(),
                stack_trace: String::new(),
                message: message.into(),
            }),
        }
    }
}

/// Discriminator of a decoded [`StreamingMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    StartStream,
    WorkerInitRequest,
    WorkerInitResponse,
    FunctionsMetadataRequest,
    FunctionMetadataResponse,
    FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse,
    WorkerWarmupRequest,
    WorkerWarmupResponse,
    /// Any content case the bridge does not interpret (invocations included).
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartStream => "start_stream",
            Self::WorkerInitRequest => "worker_init_request",
            Self::WorkerInitResponse => "worker_init_response",
            Self::FunctionsMetadataRequest => "functions_metadata_request",
            Self::FunctionMetadataResponse => "function_metadata_response",
            Self::FunctionEnvironmentReloadRequest => "function_environment_reload_request",
            Self::FunctionEnvironmentReloadResponse => "function_environment_reload_response",
            Self::WorkerWarmupRequest => "worker_warmup_request",
            Self::WorkerWarmupResponse => "worker_warmup_response",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StreamingMessage {
    pub fn new(content: Content) -> Self {
        Self {
            request_id: String::new(),
            content: Some(content),
        }
    }

    /// Handshake sent as the first message on every new stream.
    pub fn start_stream(worker_id: impl Into<String>) -> Self {
        Self::new(Content::StartStream(StartStream {
            worker_id: worker_id.into(),
        }))
    }

    pub fn worker_init_response(worker_version: impl Into<String>) -> Self {
        let capabilities = [
            CAPABILITY_ENABLE_USER_CODE_EXCEPTION,
            CAPABILITY_HANDLES_WORKER_WARMUP,
        ]
        .into_iter()
        .map(|name| (name.to_string(), "True".to_string()))
        .collect();

        Self::new(Content::WorkerInitResponse(WorkerInitResponse {
            worker_version: worker_version.into(),
            capabilities,
            result: Some(StatusResult::success()),
        }))
    }

    pub fn function_metadata_response() -> Self {
        Self::new(Content::FunctionMetadataResponse(FunctionMetadataResponse {
            result: Some(StatusResult::success()),
            use_default_metadata_indexing: true,
        }))
    }

    pub fn worker_warmup_response() -> Self {
        Self::new(Content::WorkerWarmupResponse(WorkerWarmupResponse {
            result: Some(StatusResult::success()),
        }))
    }

    pub fn function_environment_reload_response(result: StatusResult) -> Self {
        Self::new(Content::FunctionEnvironmentReloadResponse(
            FunctionEnvironmentReloadResponse {
                capabilities: HashMap::new(),
                result: Some(result),
            },
        ))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn kind(&self) -> ContentKind {
        match &self.content {
            Some(Content::StartStream(_)) => ContentKind::StartStream,
            Some(Content::WorkerInitRequest(_)) => ContentKind::WorkerInitRequest,
            Some(Content::WorkerInitResponse(_)) => ContentKind::WorkerInitResponse,
            Some(Content::FunctionsMetadataRequest(_)) => ContentKind::FunctionsMetadataRequest,
            Some(Content::FunctionMetadataResponse(_)) => ContentKind::FunctionMetadataResponse,
            Some(Content::FunctionEnvironmentReloadRequest(_)) => {
                ContentKind::FunctionEnvironmentReloadRequest
            }
            Some(Content::FunctionEnvironmentReloadResponse(_)) => {
                ContentKind::FunctionEnvironmentReloadResponse
            }
            Some(Content::WorkerWarmupRequest(_)) => ContentKind::WorkerWarmupRequest,
            Some(Content::WorkerWarmupResponse(_)) => ContentKind::WorkerWarmupResponse,
            None => ContentKind::Other,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::from(self.encode_to_vec())
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, prost::DecodeError> {
        Self::decode(envelope.as_bytes())
    }
}
