//! Configuration validation.
//!
//! Semantic checks that serde cannot express. All errors are collected so
//! a bad file is reported in one pass, and validation runs before any
//! listener is bound.

use std::net::SocketAddr;

use thiserror::Error;

use crate::capture::record::MAX_RECORD_BODY_LEN;
use crate::config::schema::AppConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid max_client_hello_size, must be between [1, 16384]: {0}")]
    MaxClientHelloSize(usize),

    #[error("invalid {field}: {value}")]
    Address { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("TLS {0} path is empty")]
    EmptyTlsPath(&'static str),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let size = config.client_hello.max_client_hello_size;
    if !(1..=MAX_RECORD_BODY_LEN).contains(&size) {
        errors.push(ValidationError::MaxClientHelloSize(size));
    }

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::EmptyTlsPath("cert"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::EmptyTlsPath("key"));
        }
    }

    if config.timeouts.handshake_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.handshake_secs"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.request_secs"));
    }

    if let Some(upstream) = &config.upstream.address {
        check_addr(&mut errors, "upstream.address", upstream);
    }
    if config.observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::Address {
            field,
            value: value.to_string(),
        });
    }
}
