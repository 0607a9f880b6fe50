//! ClientHello lookup for HTTP requests.
//!
//! Recomputes the connection key from request context, reads the cache and
//! attaches the captured value to the request twice over: as the
//! `X-TLS-ClientHello` header (for upstreams) and as a [`CapturedHello`]
//! extension (for local handlers). A miss leaves both absent; the request
//! proceeds either way. Requests on plaintext connections are never
//! enriched.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, Version},
    middleware::Next,
    response::Response,
};

use crate::capture::{CachedHello, ConnectionContext, HelloCache, Interceptor, SharedKeyDerivation};
use crate::observability::metrics;

/// Header carrying the captured value to downstream consumers.
pub const CLIENT_HELLO_HEADER: HeaderName = HeaderName::from_static("x-tls-clienthello");

/// Captured value attached to a request on a cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedHello(pub CachedHello);

impl CapturedHello {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Cache reader bound to the same key derivation the interceptor uses.
#[derive(Clone)]
pub struct HelloLookup {
    cache: HelloCache,
    keys: SharedKeyDerivation,
}

impl HelloLookup {
    pub fn new(cache: HelloCache, keys: SharedKeyDerivation) -> Self {
        Self { cache, keys }
    }

    /// Build a lookup that agrees with `interceptor` on keys by construction.
    pub fn for_interceptor(interceptor: &Interceptor) -> Self {
        Self::new(interceptor.cache().clone(), interceptor.keys().clone())
    }

    /// Find the capture for the connection `conn` describes.
    ///
    /// Candidate keys are tried in the order the key derivation gives them.
    pub fn lookup(&self, conn: &ConnectionContext) -> Option<CachedHello> {
        let hit = self
            .keys
            .at_request(conn)
            .iter()
            .find_map(|key| self.cache.get(key));
        metrics::record_lookup(hit.is_some());

        if hit.is_none() {
            tracing::debug!(peer = %conn.peer, "ClientHello missing from cache");
        }
        hit
    }
}

/// Middleware attaching the captured ClientHello to each request.
///
/// Any client-supplied `X-TLS-ClientHello` header is dropped first, so the
/// header only ever carries a value this server captured.
pub async fn client_hello_middleware(
    State(lookup): State<HelloLookup>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    request.headers_mut().remove(&CLIENT_HELLO_HEADER);

    let conn = request
        .extensions()
        .get::<ConnectionContext>()
        .cloned()
        .or_else(|| {
            // Hosts that only provide ConnectInfo terminate TLS themselves.
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(peer)| ConnectionContext::new(*peer).with_tls(true))
        });

    let Some(conn) = conn else {
        tracing::warn!("No connection context on request; skipping ClientHello lookup");
        return next.run(request).await;
    };

    if !conn.tls || request.version() >= Version::HTTP_3 {
        return next.run(request).await;
    }

    if let Some(hello) = lookup.lookup(&conn) {
        tracing::trace!(peer = %conn.peer, "Adding encoded ClientHello to request");
        if let Ok(value) = HeaderValue::from_str(hello.as_str()) {
            request.headers_mut().insert(CLIENT_HELLO_HEADER, value);
        }
        request.extensions_mut().insert(CapturedHello(hello));
    }

    next.run(request).await
}
