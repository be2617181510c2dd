//! TLS termination for the relay listener.
//!
//! Certificates and keys are read from PEM files. Handshakes run on their own
//! tasks so a slow client cannot hold up the accept loop; failed handshakes
//! are logged and dropped.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::RelayError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PENDING_HANDSHAKES: usize = 64;

fn read_pem(path: &Path) -> Result<Vec<u8>, RelayError> {
    std::fs::read(path).map_err(|source| RelayError::ReadTlsFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Build a TLS acceptor from the configured certificate chain and key.
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, RelayError> {
    let cert_pem = read_pem(&config.cert)?;
    let key_pem = read_pem(&config.key)?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| RelayError::ParsePem {
            path: config.cert.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(RelayError::NoCertificates(config.cert.clone()));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|source| RelayError::ParsePem {
            path: config.key.clone(),
            source,
        })?
        .ok_or_else(|| RelayError::NoPrivateKey(config.key.clone()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    // WebSocket upgrades ride on HTTP/1.1.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// A TCP listener that yields already-handshaken TLS streams to `axum::serve`.
pub struct TlsListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(PENDING_HANDSHAKES);
        tokio::spawn(accept_loop(listener, acceptor, tx));
        Ok(Self {
            local_addr,
            incoming,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", addr, e),
                Err(_) => debug!("TLS handshake with {} timed out", addr),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The accept loop only stops once this listener is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pem_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_cert_file() {
        let config = TlsConfig {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("expected an error");
        };
        assert!(matches!(err, RelayError::ReadTlsFile { .. }));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let cert = pem_file("not a certificate\n");
        let key = pem_file("");
        let config = TlsConfig {
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("expected an error");
        };
        assert!(matches!(err, RelayError::NoCertificates(_)));
    }

    #[test]
    fn test_key_file_without_private_key() {
        // Syntactically valid PEM block; contents are never verified because
        // the key lookup fails first.
        let cert = pem_file("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        let key = pem_file("no key in here\n");
        let config = TlsConfig {
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("expected an error");
        };
        assert!(matches!(err, RelayError::NoPrivateKey(_)));
    }
}
