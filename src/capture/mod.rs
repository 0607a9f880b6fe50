//! ClientHello capture subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → interceptor.rs (wraps the socket, waits for the first read)
//!     → record.rs (peeks the 5-byte header, then the declared body)
//!     → rewind.rs (replays every peeked byte to the TLS handshake)
//!     → cache.rs (stores base64 record under the connection key)
//!
//! Later, per HTTP request:
//!     identity.rs (recomputes the key from request context)
//!     → cache.rs lookup → http::lookup attaches the value
//!
//! Connection close:
//!     interceptor.rs → cache.rs remove
//! ```
//!
//! # Design Decisions
//! - Peeking never consumes: extractor and reader share one buffer
//! - Extraction is deferred to the first read so accept never blocks
//! - The cache is an owned handle, one instance per server

pub mod cache;
pub mod identity;
pub mod interceptor;
pub mod record;
pub mod rewind;

pub use cache::{CachePolicy, CachedHello, HelloCache, EXCEEDS_MAXIMUM_SIZE};
pub use identity::{
    ConnectionContext, ConnectionKey, KeyDerivation, RemoteAddrKey, SessionIdKey,
    SharedKeyDerivation,
};
pub use interceptor::{CaptureState, CaptureStream, Interceptor};
pub use record::{ExtractError, Extraction, Record, RecordExtractor, MAX_RECORD_BODY_LEN};
pub use rewind::RewindStream;
