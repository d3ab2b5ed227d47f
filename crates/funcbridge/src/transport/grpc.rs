//! gRPC client transport to the host.
//!
//! Envelopes travel as opaque bytes: the codec below copies them to and
//! from the HTTP/2 body without touching the protobuf encoding.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use http::uri::PathAndQuery;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status, Streaming};

use crate::bridge::Envelope;
use crate::bridge::protocol::EVENT_STREAM_PATH;
use crate::stream::{Duplex, ReadOutcome, StreamStatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid host endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to connect to host at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Codec passing message bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

enum ResponseStream {
    /// Call issued; response headers not yet received.
    Pending(JoinHandle<Result<Streaming<Bytes>, Status>>),
    Open(Streaming<Bytes>),
    Closed,
}

/// The host's `EventStream` call as a [`Duplex`].
pub struct GrpcDuplex {
    requests: mpsc::Sender<Bytes>,
    responses: Mutex<ResponseStream>,
}

impl GrpcDuplex {
    /// Connect to `endpoint` (e.g. `http://127.0.0.1:50051`) and open the
    /// event stream.
    ///
    /// The call is started in the background so writes can be issued
    /// before the host sends response headers; the host only responds
    /// after it has seen the start-stream message.
    pub async fn connect(
        endpoint: &str,
        max_message_length: usize,
    ) -> Result<Self, TransportError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|source| TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                source,
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        tracing::info!(%endpoint, max_message_length, "Connected to host");
        Ok(Self::open(channel, max_message_length))
    }

    fn open(channel: Channel, max_message_length: usize) -> Self {
        let grpc = tonic::client::Grpc::new(channel)
            .max_decoding_message_size(max_message_length)
            .max_encoding_message_size(max_message_length);

        let (requests, rx) = mpsc::channel::<Bytes>(1);
        let outbound = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (bytes, rx))
        });

        let call = tokio::spawn(async move {
            let mut grpc = grpc;
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("host channel not ready: {e}")))?;
            let response = grpc
                .streaming(
                    Request::new(outbound),
                    PathAndQuery::from_static(EVENT_STREAM_PATH),
                    RawCodec,
                )
                .await?;
            tracing::debug!("Event stream established");
            Ok(response.into_inner())
        });

        Self {
            requests,
            responses: Mutex::new(ResponseStream::Pending(call)),
        }
    }
}

#[async_trait]
impl Duplex for GrpcDuplex {
    async fn write(&self, envelope: Envelope) -> bool {
        self.requests.send(envelope.into_bytes()).await.is_ok()
    }

    async fn read(&self) -> ReadOutcome {
        let mut responses = self.responses.lock().await;

        if let ResponseStream::Pending(call) = &mut *responses {
            let opened = call.await;
            match opened {
                Ok(Ok(stream)) => *responses = ResponseStream::Open(stream),
                Ok(Err(status)) => {
                    *responses = ResponseStream::Closed;
                    return ReadOutcome::Closed(status.into());
                }
                Err(e) => {
                    *responses = ResponseStream::Closed;
                    return ReadOutcome::Closed(StreamStatus::new(
                        Code::Internal,
                        format!("event stream task failed: {e}"),
                    ));
                }
            }
        }

        let ResponseStream::Open(stream) = &mut *responses else {
            return ReadOutcome::Closed(StreamStatus::new(
                Code::FailedPrecondition,
                "event stream already closed",
            ));
        };

        let outcome = match stream.message().await {
            Ok(Some(bytes)) => return ReadOutcome::Message(Envelope::from(bytes)),
            Ok(None) => StreamStatus::ok(),
            Err(status) => status.into(),
        };
        *responses = ResponseStream::Closed;
        ReadOutcome::Closed(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use futures::StreamExt;
    use futures::stream::BoxStream;
    use tokio::net::TcpListener;
    use tonic::body::BoxBody;
    use tonic::codegen::{BoxFuture, Context, Poll, Service};
    use tonic::server::{Grpc, NamedService, StreamingService};
    use tonic::transport::Server;

    use super::*;

    /// Host stand-in that echoes the first `limit` messages of the event
    /// stream, then ends the call with an OK status.
    #[derive(Clone)]
    struct EchoHost {
        limit: usize,
    }

    impl NamedService for EchoHost {
        const NAME: &'static str = "AzureFunctionsRpcMessages.FunctionRpc";
    }

    impl Service<http::Request<BoxBody>> for EchoHost {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
            let echo = EchoStream { limit: self.limit };
            Box::pin(async move { Ok(Grpc::new(RawCodec).streaming(echo, req).await) })
        }
    }

    struct EchoStream {
        limit: usize,
    }

    impl StreamingService<Bytes> for EchoStream {
        type Response = Bytes;
        type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;
        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

        fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
            let echoed = request.into_inner().take(self.limit).boxed();
            Box::pin(async move { Ok(tonic::Response::new(echoed)) })
        }
    }

    async fn serve_echo(limit: usize) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = Box::pin(stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(socket, _)| socket);
            Some((accepted, listener))
        }));
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(EchoHost { limit })
                .serve_with_incoming(incoming)
                .await
                .unwrap();
        });
        (addr, server)
    }

    #[tokio::test]
    async fn event_stream_round_trips_bytes() {
        let (addr, server) = serve_echo(2).await;
        let duplex = GrpcDuplex::connect(&format!("http://{addr}"), 1024)
            .await
            .unwrap();

        assert!(duplex.write(Envelope::from(vec![1u8, 2])).await);
        assert!(duplex.write(Envelope::from(vec![3u8])).await);

        let ReadOutcome::Message(first) = duplex.read().await else {
            panic!("expected first echoed message");
        };
        assert_eq!(first.as_bytes(), &[1, 2]);
        let ReadOutcome::Message(second) = duplex.read().await else {
            panic!("expected second echoed message");
        };
        assert_eq!(second.as_bytes(), &[3]);

        let ReadOutcome::Closed(status) = duplex.read().await else {
            panic!("expected the call to end");
        };
        assert!(status.is_ok(), "unexpected status: {status}");

        // Reading past the end reports the closed stream.
        let ReadOutcome::Closed(status) = duplex.read().await else {
            panic!("expected closed stream");
        };
        assert_eq!(status.code, Code::FailedPrecondition);

        server.abort();
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let err = GrpcDuplex::connect("http://bad host:1", 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidEndpoint { .. }));
    }

    #[tokio::test]
    async fn connect_fails_without_listener() {
        // Bind then drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = format!("http://127.0.0.1:{port}");
        let err = GrpcDuplex::connect(&endpoint, 1024).await.err().unwrap();
        match err {
            TransportError::Connect { endpoint: e, .. } => assert_eq!(e, endpoint),
            other => panic!("unexpected error: {other}"),
        }
    }
}
