//! The signup service: the one method this process serves itself.
//!
//! A worker signs up by announcing its (task, party) pair and the address
//! it listens on. The handler dials that address back with the configured
//! client-side credentials before anything is published, so every registry
//! entry carries a connection that was live at insertion time. Subsequent
//! forwarded calls reuse that connection; no per-call dial happens.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::PathAndQuery;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::server::UnaryService;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tower::Service;
use tracing::{info, warn};

use crate::creds::TransportSecurity;
use crate::proto::{Boolean, SignupRequest, SIGNUP_METHOD};
use crate::registry::{RegisteredTask, TaskRegistry};

/// Serves `Signup(SignupRequest) -> Boolean` on the signup route.
#[derive(Clone)]
pub struct SignupService {
    inner: Arc<SignupInner>,
}

struct SignupInner {
    registry: Arc<TaskRegistry>,
    security: TransportSecurity,
}

impl SignupService {
    pub fn new(registry: Arc<TaskRegistry>, security: TransportSecurity) -> Self {
        SignupService {
            inner: Arc::new(SignupInner { registry, security }),
        }
    }
}

impl SignupInner {
    async fn signup(&self, request: Request<SignupRequest>) -> Result<Response<Boolean>, Status> {
        // The worker must be an authenticated peer; without peer info there
        // is nobody to dial back for.
        let peer = request
            .remote_addr()
            .ok_or_else(|| Status::unknown("failed to retrieve the signup peer info"))?;
        let req = request.into_inner();
        info!(
            "signup from {}: task {} party {} type {} at {}",
            peer, req.task_id, req.party_id, req.service_type, req.address
        );

        let channel = dial_task(&self.security, &req.address)
            .await
            .map_err(|e| {
                warn!("dial back to task at {} failed: {e}", req.address);
                Status::unavailable(format!("failed to dial task at {}: {e}", req.address))
            })?;

        let replaced = self.registry.insert(RegisteredTask {
            task_id: req.task_id,
            party_id: req.party_id,
            service_type: req.service_type,
            address: req.address,
            channel,
        });
        if let Some(old) = replaced {
            // Dropping the displaced record closes its connection once the
            // calls still running on it complete.
            info!("signup replaced {}; closing connection to {}", old.key(), old.address);
        }

        Ok(Response::new(Boolean { result: true }))
    }
}

/// How long a dial-back may take before the signup is failed.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials a worker's advertised address using the client-side credentials.
async fn dial_task(
    security: &TransportSecurity,
    address: &str,
) -> Result<Channel, tonic::transport::Error> {
    let scheme = if security.client_tls().is_some() {
        "https"
    } else {
        "http"
    };
    let mut endpoint =
        Endpoint::from_shared(format!("{scheme}://{address}"))?.connect_timeout(DIAL_TIMEOUT);
    if let Some(tls) = security.client_tls() {
        endpoint = endpoint.tls_config(tls.clone())?;
    }
    endpoint.connect().await
}

impl Service<http::Request<axum::body::Body>> for SignupService {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let method = SignupMethod(self.inner.clone());
        Box::pin(async move {
            let mut grpc =
                tonic::server::Grpc::new(ProstCodec::<Boolean, SignupRequest>::default());
            Ok(grpc.unary(method, req).await)
        })
    }
}

struct SignupMethod(Arc<SignupInner>);

impl UnaryService<SignupRequest> for SignupMethod {
    type Response = Boolean;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Boolean>, Status>> + Send>>;

    fn call(&mut self, request: Request<SignupRequest>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.signup(request).await })
    }
}

/// Client stub workers use to announce themselves to their local process.
#[derive(Debug, Clone)]
pub struct SignupClient {
    inner: tonic::client::Grpc<Channel>,
}

impl SignupClient {
    /// Dials the signup endpoint, with the client-side credentials when
    /// configured.
    pub async fn connect(
        address: &str,
        security: &TransportSecurity,
    ) -> Result<Self, tonic::transport::Error> {
        Ok(Self::new(dial_task(security, address).await?))
    }

    pub fn new(channel: Channel) -> Self {
        SignupClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Announces the (task, party) pair served at `request.address`.
    pub async fn signup(&mut self, request: SignupRequest) -> Result<Boolean, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("signup service was not ready: {e}")))?;
        let path = PathAndQuery::from_static(SIGNUP_METHOD);
        let codec = ProstCodec::<SignupRequest, Boolean>::default();
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }
}
