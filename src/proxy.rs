//! The transparent stream handler.
//!
//! Installed as the catch-all for every method the server does not serve
//! itself, so the process needs zero knowledge of the application
//! protocol: adding a new task type requires no change here. Each call is
//! spliced onto a stream of the same fully qualified method on the
//! upstream connection the director picked, and frames are pumped in both
//! directions concurrently until either side closes.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::stream::Stream;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::StreamingService;
use tonic::{Request, Response, Status, Streaming};
use tower::Service;
use tracing::{debug, trace};

use crate::codec::{Frame, RawCodec};
use crate::director;
use crate::registry::TaskRegistry;

/// Frames buffered between the two halves of a splice before the inbound
/// reader waits on upstream flow control.
const FORWARD_DEPTH: usize = 16;

/// Message frames pass through unparsed, so the default 4MB decode limit
/// would cap what workers may exchange.
const MAX_MESSAGE_SIZE: usize = usize::MAX;

/// Catch-all service for the forwarding listener.
///
/// Every request reaching it is treated as a bidirectional stream of
/// opaque frames regardless of the call's real cardinality; the peers'
/// stubs enforce that. Routing failures end the call before any upstream
/// contact.
#[derive(Clone)]
pub struct ProxyService {
    registry: Arc<TaskRegistry>,
}

impl ProxyService {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        ProxyService { registry }
    }
}

impl Service<http::Request<axum::body::Body>> for ProxyService {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let relay = RelayCall {
            registry: self.registry.clone(),
            method: req.uri().path().to_owned(),
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec)
                .apply_max_message_size_config(Some(MAX_MESSAGE_SIZE), Some(MAX_MESSAGE_SIZE));
            Ok(grpc.streaming(relay, req).await)
        })
    }
}

/// One forwarded call, bound to the method name recovered from the
/// request path.
struct RelayCall {
    registry: Arc<TaskRegistry>,
    method: String,
}

impl StreamingService<Frame> for RelayCall {
    type Response = Frame;
    type ResponseStream = ReplyStream;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let registry = self.registry.clone();
        let method = std::mem::take(&mut self.method);
        Box::pin(relay(registry, method, request))
    }
}

async fn relay(
    registry: Arc<TaskRegistry>,
    method: String,
    request: Request<Streaming<Frame>>,
) -> Result<Response<ReplyStream>, Status> {
    let route = director::direct(&registry, request.metadata())?;
    debug!("forwarding {} to {}", method, route.key);
    let path = PathAndQuery::try_from(method.as_str())
        .map_err(|_| Status::internal(format!("invalid method path {method}")))?;

    let mut client = tonic::client::Grpc::new(route.channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);
    client
        .ready()
        .await
        .map_err(|e| Status::unavailable(format!("upstream for {} not ready: {e}", route.key)))?;

    // The forward half starts before the outbound call is awaited: for
    // client-streaming shapes the upstream only answers once it has
    // consumed request frames.
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(FORWARD_DEPTH);
    let inbound = request.into_inner();
    tokio::spawn(forward(inbound, tx, cancel.clone()));

    let mut outbound = Request::new(ReceiverStream::new(rx));
    *outbound.metadata_mut() = route.metadata;

    let reply = match client.streaming(outbound, path, RawCodec).await {
        Ok(reply) => reply,
        Err(status) => {
            cancel.cancel();
            debug!("upstream refused {}: {:?}", method, status);
            return Err(status);
        }
    };

    // Upstream response headers travel back verbatim.
    let (metadata, upstream, extensions) = reply.into_parts();
    let replies = ReplyStream::new(upstream, cancel, method);
    Ok(Response::from_parts(metadata, replies, extensions))
}

/// Inbound-to-upstream half of the splice.
///
/// Clean end of the inbound stream drops the sender, which half-closes the
/// upstream send side. Any other inbound failure cancels both halves.
async fn forward(mut inbound: Streaming<Frame>, tx: mpsc::Sender<Frame>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            received = inbound.message() => match received {
                Ok(Some(frame)) => {
                    trace!("forwarding frame of {} bytes", frame.len());
                    if tx.send(frame).await.is_err() {
                        // Upstream went away; its status travels back on
                        // the reply half.
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    debug!("inbound stream failed: {:?}", status);
                    cancel.cancel();
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

/// Upstream-to-inbound half of the splice.
///
/// Ends when upstream finishes or either half is cancelled; on upstream
/// failure the upstream status, trailers included, is what the inbound
/// peer sees. Dropping the inner [`Streaming`] when the stream winds down
/// also cancels the outbound call if the peer is stuck.
pub struct ReplyStream {
    inner: Pin<Box<dyn Stream<Item = Result<Frame, Status>> + Send>>,
}

impl ReplyStream {
    fn new(mut upstream: Streaming<Frame>, cancel: CancellationToken, method: String) -> Self {
        let inner = stream! {
            loop {
                tokio::select! {
                    received = upstream.message() => match received {
                        Ok(Some(frame)) => {
                            trace!("returning frame of {} bytes", frame.len());
                            yield Ok(frame);
                        }
                        Ok(None) => {
                            match upstream.trailers().await {
                                Ok(Some(trailers)) if !trailers.is_empty() => {
                                    debug!("{} finished, upstream trailers {:?}", method, trailers);
                                }
                                Ok(_) => debug!("{} finished", method),
                                Err(status) => yield Err(status),
                            }
                            break;
                        }
                        Err(status) => {
                            debug!("upstream stream for {} failed: {:?}", method, status);
                            yield Err(status);
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            // Joining point of the two halves: however this side ended,
            // the forward half must not outlive it.
            cancel.cancel();
        };
        ReplyStream {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<Frame, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
