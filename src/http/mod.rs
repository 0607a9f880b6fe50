//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Intercepted TCP/TLS connection
//!     → server.rs (accept loop, TLS, hyper auto HTTP/1.1 + HTTP/2)
//!     → lookup.rs (recompute connection key, attach captured ClientHello)
//!     → proxy.rs (forward to upstream) or local inspection handler
//!     → Send to client
//! ```

pub mod lookup;
pub mod proxy;
pub mod server;

pub use lookup::{client_hello_middleware, CapturedHello, HelloLookup, CLIENT_HELLO_HEADER};
pub use server::{HttpServer, InspectResponse, ServerError};
