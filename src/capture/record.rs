//! TLS handshake record extraction.
//!
//! Peeks the first record of a connection through a [`RewindStream`] and
//! returns it as an opaque blob. Nothing past the 5-byte record header is
//! interpreted, apart from the optional legacy session id accessor on
//! [`Record`].
//!
//! # Record layout
//! ```text
//! 0       1       3       5
//! +-------+-------+-------+------------------+
//! | 0x16  |version|  len  | body (len bytes) |
//! +-------+-------+-------+------------------+
//! ```

use std::future::poll_fn;
use std::io;
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::capture::rewind::RewindStream;

/// Content type tag of a handshake record.
pub const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;

/// Size of the record header (type, version, length).
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest body a record may declare (2^14).
pub const MAX_RECORD_BODY_LEN: usize = 16_384;

const CLIENT_HELLO_HANDSHAKE_TYPE: u8 = 0x01;
// header(5) + handshake type(1) + handshake length(3) + client version(2) + random(32)
const SESSION_ID_OFFSET: usize = 43;
const MAX_SESSION_ID_LEN: usize = 32;

/// Reasons extraction did not yield a record.
///
/// None of these are fatal: the connection continues either way and the
/// peeked bytes are replayed to the real reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotAHandshakeRecord(u8),

    #[error("ClientHello exceeds maximum size ({declared} > {max} bytes)")]
    RecordTooLarge { declared: usize, max: usize },

    #[error("connection closed after {0} of 5 header bytes")]
    IncompleteHeader(usize),

    #[error("connection closed after {available} of {declared} body bytes")]
    IncompleteBody { declared: usize, available: usize },
}

/// A complete handshake record: header followed by its declared body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Vec<u8>);

impl Record {
    /// Build a record from raw bytes, checking header and length agree.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LEN || bytes[0] != HANDSHAKE_CONTENT_TYPE {
            return None;
        }
        let declared = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        (bytes.len() == RECORD_HEADER_LEN + declared).then_some(Self(bytes))
    }

    /// Content type tag, always [`HANDSHAKE_CONTENT_TYPE`].
    pub fn content_type(&self) -> u8 {
        self.0[0]
    }

    /// Protocol version bytes from the header, uninterpreted.
    pub fn version(&self) -> [u8; 2] {
        [self.0[1], self.0[2]]
    }

    /// Body length declared in the header.
    pub fn body_len(&self) -> usize {
        self.0.len() - RECORD_HEADER_LEN
    }

    pub fn body(&self) -> &[u8] {
        &self.0[RECORD_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Standard base64 of the whole record, the form stored in the cache.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Legacy session id carried in a ClientHello body, if any.
    ///
    /// Read from a fixed offset, so it is `None` for anything that is not
    /// shaped like a ClientHello or whose session id is empty.
    pub fn session_id(&self) -> Option<&[u8]> {
        if self.0.get(RECORD_HEADER_LEN) != Some(&CLIENT_HELLO_HANDSHAKE_TYPE) {
            return None;
        }
        let len = *self.0.get(SESSION_ID_OFFSET)? as usize;
        if len == 0 || len > MAX_SESSION_ID_LEN {
            return None;
        }
        let start = SESSION_ID_OFFSET + 1;
        self.0.get(start..start + len)
    }
}

impl AsRef<[u8]> for Record {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// The record, or why there is none.
    pub result: Result<Record, ExtractError>,
    /// How many bytes were peeked; these are still pending replay.
    pub peeked: usize,
}

/// Peeks one handshake record off the front of a stream.
#[derive(Debug, Clone, Copy)]
pub struct RecordExtractor {
    max_body_len: usize,
}

impl Default for RecordExtractor {
    fn default() -> Self {
        Self::new(MAX_RECORD_BODY_LEN)
    }
}

impl RecordExtractor {
    /// Create an extractor rejecting bodies longer than `max_body_len`.
    ///
    /// The value is clamped to the protocol maximum; range checking against
    /// user input happens during config validation.
    pub fn new(max_body_len: usize) -> Self {
        Self {
            max_body_len: max_body_len.min(MAX_RECORD_BODY_LEN),
        }
    }

    pub fn max_body_len(&self) -> usize {
        self.max_body_len
    }

    /// Drive extraction against the stream's replay buffer.
    ///
    /// Safe to call again after `Pending`: progress lives in the stream's
    /// buffer, not in the extractor. Only I/O errors from the inner stream
    /// are returned as `Err`.
    pub fn poll_extract<S>(
        &self,
        cx: &mut Context<'_>,
        stream: &mut RewindStream<S>,
    ) -> Poll<io::Result<Extraction>>
    where
        S: AsyncRead + Unpin,
    {
        // The content type is decidable from one byte, so a plaintext peer
        // that sends less than a full header is never stalled.
        let available = ready!(stream.poll_fill(cx, 1))?;
        if available == 0 {
            return Poll::Ready(Ok(failed(ExtractError::IncompleteHeader(0), 0)));
        }
        let content_type = stream.peeked()[0];
        if content_type != HANDSHAKE_CONTENT_TYPE {
            return Poll::Ready(Ok(failed(
                ExtractError::NotAHandshakeRecord(content_type),
                available,
            )));
        }

        let available = ready!(stream.poll_fill(cx, RECORD_HEADER_LEN))?;
        if available < RECORD_HEADER_LEN {
            return Poll::Ready(Ok(failed(
                ExtractError::IncompleteHeader(available),
                available,
            )));
        }

        let header = stream.peeked();
        let declared = u16::from_be_bytes([header[3], header[4]]) as usize;
        if declared > self.max_body_len {
            return Poll::Ready(Ok(failed(
                ExtractError::RecordTooLarge {
                    declared,
                    max: self.max_body_len,
                },
                available,
            )));
        }

        let total = RECORD_HEADER_LEN + declared;
        let available = ready!(stream.poll_fill(cx, total))?;
        if available < total {
            return Poll::Ready(Ok(failed(
                ExtractError::IncompleteBody {
                    declared,
                    available: available - RECORD_HEADER_LEN,
                },
                available,
            )));
        }

        Poll::Ready(Ok(Extraction {
            result: Ok(Record(stream.peeked()[..total].to_vec())),
            peeked: total,
        }))
    }

    /// Async form of [`poll_extract`](Self::poll_extract).
    pub async fn extract<S>(&self, stream: &mut RewindStream<S>) -> io::Result<Extraction>
    where
        S: AsyncRead + Unpin,
    {
        poll_fn(|cx| self.poll_extract(cx, stream)).await
    }
}

fn failed(error: ExtractError, peeked: usize) -> Extraction {
    Extraction {
        result: Err(error),
        peeked,
    }
}
