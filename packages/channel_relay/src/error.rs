use std::path::PathBuf;

/// Failures while preparing the relay to serve. The relay core itself has
/// no error paths.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidBindAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("TLS requires both a certificate and a key (missing {missing})")]
    IncompleteTls { missing: &'static str },

    #[error("failed to read {path}: {source}")]
    ReadTlsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse PEM in {path}: {source}")]
    ParsePem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}
