//! Connection identity shared by the capture and lookup sides.
//!
//! The interceptor sees the raw accepted socket; the HTTP layer sees only
//! the per-request [`ConnectionContext`]. A [`KeyDerivation`] must produce
//! the same [`ConnectionKey`] from both for a given connection, otherwise
//! every lookup misses.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::capture::record::Record;

/// Cache key identifying one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_peer(peer: SocketAddr) -> Self {
        Self(peer.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the application layer knows about the connection a request came in on.
///
/// Attached to every request as an extension by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Remote endpoint of the accepted socket.
    pub peer: SocketAddr,
    /// Whether TLS was terminated on this connection.
    pub tls: bool,
    /// Session id negotiated by the TLS layer, when the host exposes one.
    pub session_id: Option<Vec<u8>>,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            tls: false,
            session_id: None,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<Vec<u8>>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Strategy for deriving a [`ConnectionKey`] at both observation points.
pub trait KeyDerivation: Send + Sync + 'static {
    /// Key to store a capture under. `record` is `None` when no complete
    /// record was captured (e.g. it exceeded the maximum size).
    fn at_accept(&self, peer: SocketAddr, record: Option<&Record>) -> ConnectionKey;

    /// Keys a capture for `conn` may be stored under, most specific first.
    ///
    /// Must include every key `at_accept` can return for this connection,
    /// including the one used when no complete record was captured.
    fn at_request(&self, conn: &ConnectionContext) -> Vec<ConnectionKey>;
}

/// Shared strategy handle.
pub type SharedKeyDerivation = Arc<dyn KeyDerivation>;

/// Keys by remote socket address (`ip:port`).
///
/// Always available and unique among concurrently open connections since
/// the ephemeral port differs, even behind address translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddrKey;

impl KeyDerivation for RemoteAddrKey {
    fn at_accept(&self, peer: SocketAddr, _record: Option<&Record>) -> ConnectionKey {
        ConnectionKey::from_peer(peer)
    }

    fn at_request(&self, conn: &ConnectionContext) -> Vec<ConnectionKey> {
        vec![ConnectionKey::from_peer(conn.peer)]
    }
}

/// Keys by the ClientHello legacy session id, falling back to the remote address.
///
/// Only usable when the host's TLS layer fills
/// [`ConnectionContext::session_id`] with the same bytes the client sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionIdKey;

impl KeyDerivation for SessionIdKey {
    fn at_accept(&self, peer: SocketAddr, record: Option<&Record>) -> ConnectionKey {
        match record.and_then(Record::session_id) {
            Some(id) => ConnectionKey(STANDARD.encode(id)),
            None => ConnectionKey::from_peer(peer),
        }
    }

    fn at_request(&self, conn: &ConnectionContext) -> Vec<ConnectionKey> {
        let peer = ConnectionKey::from_peer(conn.peer);
        match conn.session_id.as_deref() {
            Some(id) if !id.is_empty() => vec![ConnectionKey(STANDARD.encode(id)), peer],
            _ => vec![peer],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_with_session_id(session_id: &[u8]) -> Record {
        let mut body = vec![0x01, 0x00, 0x00, 0x00, 0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);

        let mut bytes = vec![0x16, 0x03, 0x01];
        bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&body);
        Record::from_bytes(bytes).unwrap()
    }

    #[test]
    fn remote_addr_key_agrees_on_both_sides() {
        let peer: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        let strategy = RemoteAddrKey;

        let stored = strategy.at_accept(peer, None);
        let looked_up = strategy.at_request(&ConnectionContext::new(peer).with_tls(true));
        assert_eq!(looked_up, vec![stored.clone()]);
        assert_eq!(stored.as_str(), "203.0.113.5:51000");
    }

    #[test]
    fn ipv6_peers_are_bracketed() {
        let peer: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(RemoteAddrKey.at_accept(peer, None).as_str(), "[2001:db8::1]:443");
    }

    #[test]
    fn session_id_key_agrees_when_host_exposes_the_id() {
        let peer: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        let record = hello_with_session_id(&[9; 32]);

        let stored = SessionIdKey.at_accept(peer, Some(&record));
        let ctx = ConnectionContext::new(peer).with_session_id(Some(vec![9; 32]));
        assert_eq!(
            SessionIdKey.at_request(&ctx),
            vec![stored.clone(), ConnectionKey::from_peer(peer)]
        );
        assert_ne!(stored, ConnectionKey::from_peer(peer));
    }

    #[test]
    fn oversized_record_key_is_a_request_candidate() {
        let peer: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        let stored = SessionIdKey.at_accept(peer, None);

        let ctx = ConnectionContext::new(peer).with_session_id(Some(vec![9; 32]));
        assert!(SessionIdKey.at_request(&ctx).contains(&stored));
    }

    #[test]
    fn session_id_key_falls_back_to_peer() {
        let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let record = hello_with_session_id(&[]);

        assert_eq!(
            SessionIdKey.at_accept(peer, Some(&record)),
            ConnectionKey::from_peer(peer)
        );
        assert_eq!(
            SessionIdKey.at_request(&ConnectionContext::new(peer).with_session_id(Some(Vec::new()))),
            vec![ConnectionKey::from_peer(peer)]
        );
    }
}
