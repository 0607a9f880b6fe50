//! HTTP server setup and the intercepting accept loop.
//!
//! # Responsibilities
//! - Accept TCP connections with backpressure
//! - Wrap every connection in the ClientHello interceptor
//! - Terminate TLS (optional) with a handshake deadline
//! - Serve HTTP/1.1 and HTTP/2 through an Axum router
//! - Attach connection context so the lookup middleware can find captures
//! - Drain open connections on shutdown

use std::path::Path;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware,
    response::Json,
    Router,
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::capture::{
    CaptureStream, ConnectionContext, HelloCache, Interceptor, RecordExtractor,
};
use crate::config::AppConfig;
use crate::http::lookup::{client_hello_middleware, CapturedHello, HelloLookup};
use crate::http::proxy::{proxy_handler, UpstreamState};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::tls::build_acceptor;

/// Error type for server startup and operation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("TLS setup failed: {0}")]
    Tls(std::io::Error),

    #[error("invalid upstream address: {0}")]
    Upstream(#[from] axum::http::uri::InvalidUri),
}

/// Body of the local inspection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectResponse {
    pub remote_addr: Option<String>,
    pub tls: bool,
    pub client_hello: Option<String>,
}

/// Intercepting HTTP server.
pub struct HttpServer {
    router: Router,
    config: AppConfig,
    interceptor: Interceptor,
}

impl HttpServer {
    /// Create a server with its own cache built from the configured policy.
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        let cache = HelloCache::new(config.cache.policy());
        Self::with_cache(config, cache)
    }

    /// Create a server around an existing cache handle.
    pub fn with_cache(config: AppConfig, cache: HelloCache) -> Result<Self, ServerError> {
        let extractor = RecordExtractor::new(config.client_hello.max_client_hello_size);
        let interceptor = Interceptor::new(extractor, cache);
        let router = Self::build_router(&config, &interceptor)?;

        Ok(Self {
            router,
            config,
            interceptor,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &AppConfig, interceptor: &Interceptor) -> Result<Router, ServerError> {
        let app = match &config.upstream.address {
            Some(address) => Router::new()
                .fallback(proxy_handler)
                .with_state(UpstreamState::new(address)?),
            None => Router::new().fallback(inspect_handler),
        };

        let lookup = HelloLookup::for_interceptor(interceptor);
        Ok(app
            .layer(middleware::from_fn_with_state(lookup, client_hello_middleware))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid)))
    }

    /// Handle to the correlation cache this server populates.
    pub fn cache(&self) -> &HelloCache {
        self.interceptor.cache()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the accept loop until `shutdown` fires, then drain connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ServerError> {
        let tls = match &self.config.listener.tls {
            Some(tls) => Some(
                build_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                    .await
                    .map_err(ServerError::Tls)?,
            ),
            None => None,
        };

        let addr = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(
            address = %addr,
            tls = tls.is_some(),
            max_client_hello_size = self.config.client_hello.max_client_hello_size,
            "HTTP server starting"
        );

        let tracker = ConnectionTracker::new();
        let handshake_timeout = Duration::from_secs(self.config.timeouts.handshake_secs);

        loop {
            // Accept is polled first so a closed listener ends the loop.
            let (stream, peer, permit) = tokio::select! {
                biased;
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(ListenerError::Closed) => {
                        tracing::info!("Listener closed, no longer accepting");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
                _ = shutdown.triggered() => {
                    tracing::info!("Shutdown signal received");
                    listener.close();
                    continue;
                }
            };

            let connection = Connection {
                io: self.interceptor.wrap(stream, peer),
                tls: tls.clone(),
                router: self.router.clone(),
                handshake_timeout,
                guard: tracker.track(),
                _permit: permit,
            };
            tokio::spawn(connection.serve());
        }

        let deadline = Duration::from_secs(self.config.timeouts.shutdown_secs);
        if !tracker.wait_for_idle(deadline).await {
            tracing::warn!(
                open_connections = tracker.active_count(),
                "Shutdown deadline passed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// One accepted connection and everything it holds until it closes.
struct Connection {
    io: CaptureStream<TcpStream>,
    tls: Option<TlsAcceptor>,
    router: Router,
    handshake_timeout: Duration,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
}

impl Connection {
    async fn serve(self) {
        let id = self.guard.id();
        let peer = self.io.peer();
        let context = ConnectionContext::new(peer);

        match self.tls {
            Some(acceptor) => {
                // The handshake's first read is what triggers ClientHello capture.
                match tokio::time::timeout(self.handshake_timeout, acceptor.accept(self.io)).await {
                    Ok(Ok(stream)) => {
                        serve_http(stream, context.with_tls(true), self.router, id).await
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(connection_id = %id, peer = %peer, error = %e, "TLS handshake failed")
                    }
                    Err(_) => {
                        tracing::debug!(connection_id = %id, peer = %peer, "TLS handshake timed out")
                    }
                }
            }
            None => serve_http(self.io, context, self.router, id).await,
        }
    }
}

async fn serve_http<I>(
    io: I,
    context: ConnectionContext,
    router: Router,
    id: ConnectionId,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = context.peer;
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request.extensions_mut().insert(context.clone());
        router.clone().oneshot(request)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        tracing::debug!(connection_id = %id, peer = %peer, error = %e, "Connection closed with error");
    }
}

/// Default handler: report what was captured for this request's connection.
async fn inspect_handler(request: Request<Body>) -> Json<InspectResponse> {
    let context = request.extensions().get::<ConnectionContext>();
    let captured = request.extensions().get::<CapturedHello>();

    Json(InspectResponse {
        remote_addr: context.map(|c| c.peer.to_string()),
        tls: context.is_some_and(|c| c.tls),
        client_hello: captured.map(|c| c.as_str().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CachedHello, ConnectionKey};
    use std::net::SocketAddr;

    #[tokio::test]
    async fn inspect_reports_capture_for_connection() {
        let server = HttpServer::new(AppConfig::default()).unwrap();
        let peer: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        server.cache().put(
            ConnectionKey::from_peer(peer),
            CachedHello::Encoded("FgMDAAKquw==".into()),
        );

        let mut request = Request::builder().uri("/anything").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectionContext::new(peer).with_tls(true));

        let response = server.router.clone().oneshot(request).await.unwrap();
        assert!(response.headers().contains_key("x-request-id"));

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: InspectResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            InspectResponse {
                remote_addr: Some("203.0.113.5:51000".into()),
                tls: true,
                client_hello: Some("FgMDAAKquw==".into()),
            }
        );
    }

    #[test]
    fn invalid_upstream_is_rejected() {
        let mut config = AppConfig::default();
        config.upstream.address = Some("bad upstream".into());
        assert!(matches!(
            HttpServer::new(config),
            Err(ServerError::Upstream(_))
        ));
    }
}
