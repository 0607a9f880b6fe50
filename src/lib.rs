//! TLS ClientHello capture and correlation.
//!
//! Peeks the first handshake record of every accepted connection without
//! disturbing the handshake, caches it under the connection's identity, and
//! hands it to the HTTP layer on each request that connection carries.

pub mod capture;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use capture::{HelloCache, Interceptor};
pub use config::AppConfig;
pub use http::HttpServer;
pub use lifecycle::{Shutdown, ShutdownSignal};
