//! TLS configuration and certificate loading.

use std::io;
use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use tokio_rustls::TlsAcceptor;

/// ALPN protocols offered to clients, preferred first.
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, io::Error> {
    if !cert_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Build the acceptor used to terminate TLS on intercepted connections.
pub async fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, io::Error> {
    let config = load_tls_config(cert_path, key_path).await?;

    let mut server_config = (*config.get_inner()).clone();
    server_config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    tracing::info!(cert = ?cert_path, "TLS termination enabled");
    Ok(TlsAcceptor::from(std::sync::Arc::new(server_config)))
}
