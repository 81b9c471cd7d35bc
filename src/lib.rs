#![cfg_attr(feature = "strict", deny(warnings))]

//! VIA: a transparent RPC-level proxy relaying streaming calls between
//! cooperating parties of a multi-party computation deployment.
//!
//! Local workers sign up with their own VIA process, announcing the
//! (task, party) pair they serve and where they listen. A remote party
//! dials its own VIA, which forwards the call across the wide area to the
//! peer VIA, which routes it to the right local worker based on the
//! `task_id`/`party_id` metadata carried on the call. The proxy never
//! parses a forwarded message: frames are moved as raw bytes in both
//! directions until either side closes.

pub mod codec;
pub mod conf;
pub mod creds;
pub mod director;
pub mod proto;
pub mod proxy;
pub mod registry;
pub mod signup;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::info;

use crate::creds::TransportSecurity;
use crate::proto::SIGNUP_METHOD;
use crate::proxy::ProxyService;
use crate::registry::TaskRegistry;
use crate::signup::SignupService;

/// Startup-fatal failures. Everything per-call is a [`tonic::Status`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read credential config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse credential config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("credential config is missing its `{section}` section")]
    ConfigIncomplete { section: &'static str },
    #[error("failed to read {role} credential material {path}: {source}")]
    CredentialRead {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("the gmssl cipher needs a GM-capable TLS backend, which this build does not carry")]
    GmTlsUnsupported,
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A bound VIA process: one listener carrying the signup method and the
/// transparent forwarding path for everything else.
pub struct ViaListener {
    listener: TcpListener,
    registry: Arc<TaskRegistry>,
    security: TransportSecurity,
}

impl ViaListener {
    /// Binds `addr`, which may use the `:port` shorthand for listening on
    /// every interface. Binding eagerly keeps listen failures at startup
    /// and lets callers bind port 0 and read back [`Self::local_addr`].
    pub async fn bind(addr: &str, security: TransportSecurity) -> Result<Self, Error> {
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(ViaListener {
            listener,
            registry: Arc::new(TaskRegistry::new()),
            security,
        })
    }

    /// The bound address. Useful if the requested port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Shared handle to the signup registry.
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Serves until the process dies.
    pub async fn serve(self) -> Result<(), Error> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serves until `signal` resolves, then refuses new calls and waits
    /// for active ones to finish. Bounding that wait is the caller's
    /// business.
    pub async fn serve_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<(), Error> {
        info!(
            "starting VIA server at {} ({})",
            self.local_addr(),
            if self.security.is_secure() {
                "secure"
            } else {
                "insecure"
            }
        );

        // The signup route is the sole method served directly; every other
        // path falls through to the proxy.
        let router = Router::new()
            .route_service(
                SIGNUP_METHOD,
                SignupService::new(self.registry.clone(), self.security.clone()),
            )
            .fallback_service(ProxyService::new(self.registry.clone()));

        let mut builder = Server::builder();
        if let Some(tls) = self.security.server_tls() {
            builder = builder.tls_config(tls.clone())?;
        }

        let incoming = TcpListenerStream::new(self.listener);
        builder
            .add_routes(Routes::from(router))
            .serve_with_incoming_shutdown(incoming, signal)
            .await?;

        self.registry.clear();
        Ok(())
    }
}
