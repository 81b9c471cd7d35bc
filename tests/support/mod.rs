//! In-process workers and clients for driving a live proxy over real
//! sockets.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::stream::Stream;
use http::uri::PathAndQuery;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::BoxBody;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::server::{
    ClientStreamingService, ServerStreamingService, StreamingService, UnaryService,
};
use tonic::service::Routes;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};
use tower::Service;

use via::codec::{Frame, RawCodec};
use via::creds::TransportSecurity;
use via::director::{PARTY_ID_KEY, TASK_ID_KEY};
use via::proto::{Boolean, SignupRequest};
use via::signup::SignupClient;
use via::ViaListener;

pub const SUM_UNARY: &str = "/via.test.MathService/SumUnary";
pub const SUM_CLIENT_STREAMING: &str = "/via.test.MathService/SumClientStreaming";
pub const SUM_SERVER_STREAMING: &str = "/via.test.MathService/SumServerStreaming";
pub const SUM_BIDI: &str = "/via.test.MathService/SumBidi";

const MAX_MESSAGE_SIZE: usize = usize::MAX;

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
type BoxFut<T> = Pin<Box<dyn Future<Output = Result<Response<T>, Status>> + Send>>;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metric {
    #[prost(int64, tag = "1")]
    pub metric: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricList {
    #[prost(int64, repeated, tag = "1")]
    pub metric: Vec<i64>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SumResponse {
    #[prost(int32, tag = "1")]
    pub count: i32,
    #[prost(int64, tag = "2")]
    pub val: i64,
}

/// Binds an insecure proxy on an ephemeral port and serves it for the
/// rest of the test.
pub async fn spawn_via() -> SocketAddr {
    let listener = ViaListener::bind("127.0.0.1:0", TransportSecurity::insecure())
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(async move {
        let _ = listener.serve().await;
    });
    addr
}

/// Serves `svc` as the only dispatch target of a worker listener.
pub async fn serve_worker<S>(svc: S) -> SocketAddr
where
    S: Service<
            http::Request<axum::body::Body>,
            Response = http::Response<BoxBody>,
            Error = Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = axum::Router::new().fallback_service(svc);
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_routes(Routes::from(router))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await;
    });
    addr
}

pub async fn connect(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Registers a worker with the proxy under (task, party).
pub async fn signup(
    via: SocketAddr,
    task_id: &str,
    party_id: &str,
    worker: SocketAddr,
) -> Result<Boolean, Status> {
    let mut client = SignupClient::new(connect(via).await);
    client
        .signup(SignupRequest {
            task_id: task_id.to_string(),
            party_id: party_id.to_string(),
            service_type: "test".to_string(),
            address: worker.to_string(),
        })
        .await
}

/// Attaches routing metadata to a request.
pub fn routed<T>(message: T, task: &str, party: &str) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(TASK_ID_KEY, task.parse().unwrap());
    request
        .metadata_mut()
        .insert(PARTY_ID_KEY, party.parse().unwrap());
    request
}

/// How a worker saw one of its streams end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Clean,
    Broken,
}

struct EndSignal {
    tx: Option<mpsc::UnboundedSender<StreamEnd>>,
}

impl EndSignal {
    fn send(&mut self, end: StreamEnd) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(end);
        }
    }
}

impl Drop for EndSignal {
    fn drop(&mut self) {
        // A stream torn down before its clean end counts as broken.
        self.send(StreamEnd::Broken);
    }
}

/// Frame-level worker echoing every frame of every method verbatim.
#[derive(Clone, Default)]
pub struct EchoWorker {
    events: Option<mpsc::UnboundedSender<StreamEnd>>,
}

impl EchoWorker {
    pub fn observed(events: mpsc::UnboundedSender<StreamEnd>) -> Self {
        EchoWorker {
            events: Some(events),
        }
    }
}

impl Service<http::Request<axum::body::Body>> for EchoWorker {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let svc = EchoStream {
            events: self.events.clone(),
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec)
                .apply_max_message_size_config(Some(MAX_MESSAGE_SIZE), Some(MAX_MESSAGE_SIZE));
            Ok(grpc.streaming(svc, req).await)
        })
    }
}

struct EchoStream {
    events: Option<mpsc::UnboundedSender<StreamEnd>>,
}

impl StreamingService<Frame> for EchoStream {
    type Response = Frame;
    type ResponseStream = BoxStream<Frame>;
    type Future = BoxFut<Self::ResponseStream>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let mut signal = EndSignal {
            tx: self.events.clone(),
        };
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let replies = stream! {
                loop {
                    match inbound.message().await {
                        Ok(Some(frame)) => yield Ok(frame),
                        Ok(None) => {
                            signal.send(StreamEnd::Clean);
                            break;
                        }
                        Err(_) => {
                            signal.send(StreamEnd::Broken);
                            break;
                        }
                    }
                }
            };
            let replies: Self::ResponseStream = Box::pin(replies);
            Ok(Response::new(replies))
        })
    }
}

/// Worker answering every frame with its fixed tag, so tests can tell
/// which instance served a call.
#[derive(Clone)]
pub struct TagWorker {
    pub tag: &'static str,
}

impl Service<http::Request<axum::body::Body>> for TagWorker {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let svc = TagStream { tag: self.tag };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec);
            Ok(grpc.streaming(svc, req).await)
        })
    }
}

struct TagStream {
    tag: &'static str,
}

impl StreamingService<Frame> for TagStream {
    type Response = Frame;
    type ResponseStream = BoxStream<Frame>;
    type Future = BoxFut<Self::ResponseStream>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let tag = self.tag;
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let replies = stream! {
                while let Ok(Some(_)) = inbound.message().await {
                    yield Ok(Frame::new(tag.as_bytes()));
                }
            };
            let replies: Self::ResponseStream = Box::pin(replies);
            Ok(Response::new(replies))
        })
    }
}

/// Typed worker with one method per streaming cardinality.
#[derive(Clone)]
pub struct MathWorker;

impl Service<http::Request<axum::body::Body>> for MathWorker {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let path = req.uri().path().to_owned();
        Box::pin(async move {
            let response = match path.as_str() {
                SUM_UNARY => {
                    let mut grpc =
                        tonic::server::Grpc::new(ProstCodec::<SumResponse, MetricList>::default());
                    grpc.unary(SumUnary, req).await
                }
                SUM_CLIENT_STREAMING => {
                    let mut grpc =
                        tonic::server::Grpc::new(ProstCodec::<SumResponse, Metric>::default());
                    grpc.client_streaming(SumClientStreaming, req).await
                }
                SUM_SERVER_STREAMING => {
                    let mut grpc =
                        tonic::server::Grpc::new(ProstCodec::<SumResponse, MetricList>::default());
                    grpc.server_streaming(SumServerStreaming, req).await
                }
                SUM_BIDI => {
                    let mut grpc =
                        tonic::server::Grpc::new(ProstCodec::<SumResponse, Metric>::default());
                    grpc.streaming(SumBidi, req).await
                }
                _ => http::Response::builder()
                    .status(200)
                    .header("grpc-status", "12")
                    .header("content-type", "application/grpc")
                    .body(tonic::body::empty_body())
                    .unwrap(),
            };
            Ok(response)
        })
    }
}

struct SumUnary;

impl UnaryService<MetricList> for SumUnary {
    type Response = SumResponse;
    type Future = BoxFut<SumResponse>;

    fn call(&mut self, request: Request<MetricList>) -> Self::Future {
        Box::pin(async move {
            let list = request.into_inner();
            Ok(Response::new(SumResponse {
                count: list.metric.len() as i32,
                val: list.metric.iter().sum(),
            }))
        })
    }
}

struct SumClientStreaming;

impl ClientStreamingService<Metric> for SumClientStreaming {
    type Response = SumResponse;
    type Future = BoxFut<SumResponse>;

    fn call(&mut self, request: Request<Streaming<Metric>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let mut count = 0;
            let mut val = 0;
            while let Some(metric) = inbound.message().await? {
                count += 1;
                val += metric.metric;
            }
            Ok(Response::new(SumResponse { count, val }))
        })
    }
}

struct SumServerStreaming;

impl ServerStreamingService<MetricList> for SumServerStreaming {
    type Response = SumResponse;
    type ResponseStream = BoxStream<SumResponse>;
    type Future = BoxFut<Self::ResponseStream>;

    fn call(&mut self, request: Request<MetricList>) -> Self::Future {
        Box::pin(async move {
            let list = request.into_inner();
            let replies = stream! {
                let mut count = 0;
                let mut val = 0;
                for metric in list.metric {
                    count += 1;
                    val += metric;
                    yield Ok(SumResponse { count, val });
                }
            };
            let replies: Self::ResponseStream = Box::pin(replies);
            Ok(Response::new(replies))
        })
    }
}

struct SumBidi;

impl StreamingService<Metric> for SumBidi {
    type Response = SumResponse;
    type ResponseStream = BoxStream<SumResponse>;
    type Future = BoxFut<Self::ResponseStream>;

    fn call(&mut self, request: Request<Streaming<Metric>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let replies = stream! {
                let mut count = 0;
                let mut val = 0;
                loop {
                    match inbound.message().await {
                        Ok(Some(metric)) => {
                            count += 1;
                            val += metric.metric;
                            yield Ok(SumResponse { count, val });
                        }
                        Ok(None) => break,
                        Err(status) => {
                            yield Err(status);
                            break;
                        }
                    }
                }
            };
            let replies: Self::ResponseStream = Box::pin(replies);
            Ok(Response::new(replies))
        })
    }
}

/// Schema-oblivious client calling arbitrary methods through the proxy.
pub struct RawClient {
    grpc: Grpc<Channel>,
}

impl RawClient {
    pub async fn connect(via: SocketAddr) -> Self {
        RawClient {
            grpc: Grpc::new(connect(via).await)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        }
    }

    /// Opens a bidi frame stream with explicit metadata.
    pub async fn open_with_metadata(
        &mut self,
        method: &'static str,
        metadata: &[(&'static str, &str)],
    ) -> Result<(mpsc::Sender<Frame>, Streaming<Frame>), Status> {
        self.grpc
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("proxy not ready: {e}")))?;
        let (tx, rx) = mpsc::channel(16);
        let mut request = Request::new(ReceiverStream::new(rx));
        for (key, value) in metadata {
            request.metadata_mut().insert(*key, value.parse().unwrap());
        }
        let response = self
            .grpc
            .streaming(request, PathAndQuery::from_static(method), RawCodec)
            .await?;
        Ok((tx, response.into_inner()))
    }

    /// Opens a routed bidi frame stream.
    pub async fn open(
        &mut self,
        method: &'static str,
        task: &str,
        party: &str,
    ) -> Result<(mpsc::Sender<Frame>, Streaming<Frame>), Status> {
        self.open_with_metadata(method, &[(TASK_ID_KEY, task), (PARTY_ID_KEY, party)])
            .await
    }

    /// Sends every frame, half-closes, and collects the full reply stream.
    pub async fn roundtrip(
        &mut self,
        method: &'static str,
        task: &str,
        party: &str,
        frames: Vec<Frame>,
    ) -> Result<Vec<Frame>, Status> {
        let (tx, mut replies) = self.open(method, task, party).await?;
        for frame in frames {
            tx.send(frame)
                .await
                .map_err(|_| Status::aborted("send side closed early"))?;
        }
        drop(tx);
        let mut received = Vec::new();
        while let Some(frame) = replies.message().await? {
            received.push(frame);
        }
        Ok(received)
    }
}

/// Typed client for the math worker, calling through the proxy.
pub struct MathClient {
    grpc: Grpc<Channel>,
}

impl MathClient {
    pub async fn connect(via: SocketAddr) -> Self {
        MathClient {
            grpc: Grpc::new(connect(via).await),
        }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.grpc
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("proxy not ready: {e}")))
    }

    pub async fn sum_unary(
        &mut self,
        task: &str,
        party: &str,
        values: Vec<i64>,
    ) -> Result<SumResponse, Status> {
        self.ready().await?;
        let request = routed(MetricList { metric: values }, task, party);
        let codec = ProstCodec::<MetricList, SumResponse>::default();
        let response = self
            .grpc
            .unary(request, PathAndQuery::from_static(SUM_UNARY), codec)
            .await?;
        Ok(response.into_inner())
    }

    pub async fn sum_client_streaming(
        &mut self,
        task: &str,
        party: &str,
        values: Vec<i64>,
    ) -> Result<SumResponse, Status> {
        self.ready().await?;
        let frames = tokio_stream::iter(values.into_iter().map(|metric| Metric { metric }));
        let request = routed(frames, task, party);
        let codec = ProstCodec::<Metric, SumResponse>::default();
        let response = self
            .grpc
            .client_streaming(request, PathAndQuery::from_static(SUM_CLIENT_STREAMING), codec)
            .await?;
        Ok(response.into_inner())
    }

    pub async fn sum_server_streaming(
        &mut self,
        task: &str,
        party: &str,
        values: Vec<i64>,
    ) -> Result<Vec<SumResponse>, Status> {
        self.ready().await?;
        let request = routed(MetricList { metric: values }, task, party);
        let codec = ProstCodec::<MetricList, SumResponse>::default();
        let response = self
            .grpc
            .server_streaming(request, PathAndQuery::from_static(SUM_SERVER_STREAMING), codec)
            .await?;
        let mut inbound = response.into_inner();
        let mut received = Vec::new();
        while let Some(sum) = inbound.message().await? {
            received.push(sum);
        }
        Ok(received)
    }

    pub async fn sum_bidi(
        &mut self,
        task: &str,
        party: &str,
        values: Vec<i64>,
    ) -> Result<Vec<SumResponse>, Status> {
        self.ready().await?;
        let frames = tokio_stream::iter(values.into_iter().map(|metric| Metric { metric }));
        let request = routed(frames, task, party);
        let codec = ProstCodec::<Metric, SumResponse>::default();
        let response = self
            .grpc
            .streaming(request, PathAndQuery::from_static(SUM_BIDI), codec)
            .await?;
        let mut inbound = response.into_inner();
        let mut received = Vec::new();
        while let Some(sum) = inbound.message().await? {
            received.push(sum);
        }
        Ok(received)
    }
}
