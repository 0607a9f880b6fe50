//! Per-connection ClientHello interception.
//!
//! # State machine
//! ```text
//! NotIntercepted ──first read──▶ HandshakeCaptured │ TooLarge │ NotHandshake │ Incomplete │ Errored
//!        │                                   (all of these pass bytes through)
//!        └──────────────── close (any state) ──────────────▶ Closed
//! ```
//!
//! Extraction runs lazily on the first read the protocol stack issues, never
//! at accept time, and at most once. Whatever it peeks is replayed to that
//! same read, so the TLS handshake sees an untouched byte stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::capture::cache::{CachedHello, HelloCache};
use crate::capture::identity::{ConnectionKey, RemoteAddrKey, SharedKeyDerivation};
use crate::capture::record::{ExtractError, Extraction, RecordExtractor};
use crate::capture::rewind::RewindStream;
use crate::observability::metrics;

/// Where a connection is in its capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No read issued yet.
    NotIntercepted,
    /// A complete record was cached.
    HandshakeCaptured,
    /// The record declared an oversized body; the sentinel was cached.
    TooLarge,
    /// The first byte was not a handshake record.
    NotHandshake,
    /// The peer closed before a full record arrived.
    Incomplete,
    /// The inner stream failed while peeking.
    Errored,
    /// The connection was closed.
    Closed,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::NotIntercepted => "not_intercepted",
            CaptureState::HandshakeCaptured => "captured",
            CaptureState::TooLarge => "too_large",
            CaptureState::NotHandshake => "not_handshake",
            CaptureState::Incomplete => "incomplete",
            CaptureState::Errored => "error",
            CaptureState::Closed => "closed",
        }
    }
}

/// Wraps accepted connections so their first record lands in the cache.
#[derive(Clone)]
pub struct Interceptor {
    extractor: RecordExtractor,
    cache: HelloCache,
    keys: SharedKeyDerivation,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("extractor", &self.extractor)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

impl Interceptor {
    /// Create an interceptor keying entries by remote address.
    pub fn new(extractor: RecordExtractor, cache: HelloCache) -> Self {
        Self::with_keys(extractor, cache, Arc::new(RemoteAddrKey))
    }

    /// Create an interceptor with a custom key derivation.
    pub fn with_keys(extractor: RecordExtractor, cache: HelloCache, keys: SharedKeyDerivation) -> Self {
        Self {
            extractor,
            cache,
            keys,
        }
    }

    pub fn cache(&self) -> &HelloCache {
        &self.cache
    }

    pub fn keys(&self) -> &SharedKeyDerivation {
        &self.keys
    }

    /// Wrap a freshly accepted connection. Performs no I/O.
    pub fn wrap<S>(&self, io: S, peer: SocketAddr) -> CaptureStream<S> {
        CaptureStream {
            stream: RewindStream::new(io),
            peer,
            state: CaptureState::NotIntercepted,
            key: None,
            interceptor: self.clone(),
        }
    }
}

/// A connection decorated with one-shot ClientHello capture.
///
/// Reads, writes and shutdown are forwarded to the inner stream. Closing
/// (shutdown or drop) removes whatever this connection put in the cache.
pub struct CaptureStream<S> {
    stream: RewindStream<S>,
    peer: SocketAddr,
    state: CaptureState,
    key: Option<ConnectionKey>,
    interceptor: Interceptor,
}

impl<S> CaptureStream<S> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Key this connection's capture was stored under, while it is stored.
    pub fn key(&self) -> Option<&ConnectionKey> {
        self.key.as_ref()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    fn record(&mut self, extraction: Extraction) {
        let Interceptor { cache, keys, .. } = &self.interceptor;

        self.state = match extraction.result {
            Ok(record) => {
                let key = keys.at_accept(self.peer, Some(&record));
                tracing::debug!(
                    peer = %self.peer,
                    key = %key,
                    record_len = record.as_bytes().len(),
                    "Captured ClientHello"
                );
                cache.put(key.clone(), CachedHello::from_record(&record));
                self.key = Some(key);
                CaptureState::HandshakeCaptured
            }
            Err(ExtractError::RecordTooLarge { declared, max }) => {
                let key = keys.at_accept(self.peer, None);
                tracing::debug!(peer = %self.peer, declared, max, "ClientHello exceeds maximum size");
                cache.put(key.clone(), CachedHello::ExceedsMaximumSize);
                self.key = Some(key);
                CaptureState::TooLarge
            }
            Err(err @ ExtractError::NotAHandshakeRecord(_)) => {
                tracing::trace!(peer = %self.peer, reason = %err, "Passing connection through");
                CaptureState::NotHandshake
            }
            Err(err) => {
                tracing::debug!(peer = %self.peer, reason = %err, "Failed to read ClientHello");
                CaptureState::Incomplete
            }
        };
        metrics::record_capture(self.state.as_str());
    }

    fn release(&mut self) {
        if let Some(key) = self.key.take() {
            self.interceptor.cache.remove(&key);
            tracing::trace!(peer = %self.peer, key = %key, "Released ClientHello");
        }
        self.state = CaptureState::Closed;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CaptureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.state == CaptureState::NotIntercepted {
            let extractor = this.interceptor.extractor;
            match ready!(extractor.poll_extract(cx, &mut this.stream)) {
                Ok(extraction) => this.record(extraction),
                Err(e) => {
                    tracing::debug!(peer = %this.peer, error = %e, "Read failed during ClientHello capture");
                    this.state = CaptureState::Errored;
                    metrics::record_capture(this.state.as_str());
                    return Poll::Ready(Err(e));
                }
            }
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CaptureStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.release();
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl<S> Drop for CaptureStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::cache::{CachePolicy, EXCEEDS_MAXIMUM_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const HELLO: [u8; 7] = [0x16, 0x03, 0x03, 0x00, 0x02, 0xAA, 0xBB];

    fn peer() -> SocketAddr {
        "203.0.113.5:51000".parse().unwrap()
    }

    fn interceptor(max_body_len: usize) -> Interceptor {
        Interceptor::new(
            RecordExtractor::new(max_body_len),
            HelloCache::new(CachePolicy::unbounded()),
        )
    }

    #[tokio::test]
    async fn captures_on_first_read_and_releases_on_drop() {
        let interceptor = interceptor(16_384);
        let key = ConnectionKey::new("203.0.113.5:51000");
        let data: &[u8] = &HELLO;

        let mut conn = interceptor.wrap(data, peer());
        assert_eq!(conn.state(), CaptureState::NotIntercepted);
        assert!(interceptor.cache().get(&key).is_none(), "wrap must not read");

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, HELLO);
        assert_eq!(conn.state(), CaptureState::HandshakeCaptured);
        assert_eq!(
            interceptor.cache().get(&key).unwrap().as_str(),
            "FgMDAAKquw=="
        );

        drop(conn);
        assert!(interceptor.cache().get(&key).is_none());
    }

    #[tokio::test]
    async fn extraction_runs_at_most_once() {
        let interceptor = interceptor(16_384);
        let (mut client, server) = tokio::io::duplex(64);
        let mut conn = interceptor.wrap(server, peer());

        let mut payload = HELLO.to_vec();
        payload.extend_from_slice(&HELLO);
        client.write_all(&payload).await.unwrap();

        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await.unwrap();
        let key = conn.key().cloned().unwrap();
        assert!(interceptor.cache().get(&key).is_some());

        // If later reads extracted again, the second record would be re-cached.
        interceptor.cache().remove(&key);
        let mut rest = vec![0u8; payload.len() - 1];
        conn.read_exact(&mut rest).await.unwrap();
        assert!(interceptor.cache().is_empty());
        assert_eq!(conn.state(), CaptureState::HandshakeCaptured);
    }

    #[tokio::test]
    async fn non_handshake_traffic_is_untouched() {
        let interceptor = interceptor(16_384);
        let data: &[u8] = &[0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5];

        let mut conn = interceptor.wrap(data, peer());
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(conn.state(), CaptureState::NotHandshake);
        assert!(conn.key().is_none());
        assert!(interceptor.cache().is_empty());
    }

    #[tokio::test]
    async fn oversized_record_caches_sentinel() {
        let interceptor = interceptor(1);
        let data: &[u8] = &HELLO;

        let mut conn = interceptor.wrap(data, peer());
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, HELLO);
        assert_eq!(conn.state(), CaptureState::TooLarge);
        let key = conn.key().cloned().unwrap();
        assert_eq!(
            interceptor.cache().get(&key).unwrap().as_str(),
            EXCEEDS_MAXIMUM_SIZE
        );
    }

    #[tokio::test]
    async fn truncated_record_is_not_cached() {
        let interceptor = interceptor(16_384);
        let data: &[u8] = &HELLO[..6];

        let mut conn = interceptor.wrap(data, peer());
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, &HELLO[..6]);
        assert_eq!(conn.state(), CaptureState::Incomplete);
        assert!(interceptor.cache().is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_entry_once() {
        let interceptor = interceptor(16_384);
        let (mut client, server) = tokio::io::duplex(64);
        let mut conn = interceptor.wrap(server, peer());

        client.write_all(&HELLO).await.unwrap();
        let mut out = [0u8; 7];
        conn.read_exact(&mut out).await.unwrap();
        assert_eq!(interceptor.cache().len(), 1);

        conn.shutdown().await.unwrap();
        assert_eq!(conn.state(), CaptureState::Closed);
        assert!(interceptor.cache().is_empty());

        // A newer connection reusing the key must survive this one's drop.
        let key = ConnectionKey::from_peer(peer());
        interceptor.cache().put(key.clone(), CachedHello::ExceedsMaximumSize);
        drop(conn);
        assert!(interceptor.cache().get(&key).is_some());
    }

    #[tokio::test]
    async fn closed_before_first_read_never_captures() {
        let interceptor = interceptor(16_384);
        let (mut client, server) = tokio::io::duplex(64);
        let mut conn = interceptor.wrap(server, peer());

        conn.shutdown().await.unwrap();
        client.write_all(&HELLO).await.unwrap();
        let mut out = [0u8; 7];
        conn.read_exact(&mut out).await.unwrap();

        assert_eq!(out, HELLO);
        assert_eq!(conn.state(), CaptureState::Closed);
        assert!(interceptor.cache().is_empty());
    }

    #[tokio::test]
    async fn concurrent_connections_get_independent_entries() {
        let interceptor = interceptor(16_384);
        let mut tasks = Vec::new();

        for i in 0..128u16 {
            let interceptor = interceptor.clone();
            tasks.push(tokio::spawn(async move {
                let peer: SocketAddr = format!("192.0.2.10:{}", 40_000 + i).parse().unwrap();
                let (mut client, server) = tokio::io::duplex(64);
                let mut conn = interceptor.wrap(server, peer);

                let record = [0x16, 0x03, 0x03, 0x00, 0x02, (i >> 8) as u8, i as u8];
                client.write_all(&record).await.unwrap();
                let mut out = [0u8; 7];
                conn.read_exact(&mut out).await.unwrap();
                assert_eq!(out, record);
                (conn, record)
            }));
        }

        let mut open = Vec::new();
        for task in tasks {
            open.push(task.await.unwrap());
        }
        assert_eq!(interceptor.cache().len(), 128);

        for (conn, record) in &open {
            let cached = interceptor.cache().get(conn.key().unwrap()).unwrap();
            let expected = crate::capture::record::Record::from_bytes(record.to_vec()).unwrap();
            assert_eq!(cached, CachedHello::from_record(&expected));
        }

        drop(open);
        assert!(interceptor.cache().is_empty());
    }
}
