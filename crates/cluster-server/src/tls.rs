//! mTLS acceptor construction from the `--tls-cert`/`--tls-key`/`--client-ca` triple.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::cli::TlsMinVersion;

/// Fatal, pre-listener configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TLS was partially configured (not all of cert/key/client-ca given).
    #[error("{0}")]
    PartialTls(String),
    /// A certificate/key file could not be read or parsed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that failed to load.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TLS server config could not be built from the supplied material.
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| ConfigError::Io {
            path: path.to_string(),
            source: std::io::Error::other("no private key found in file"),
        })
}

/// Build a mutually-authenticated `TlsAcceptor` from a server cert, its key,
/// and a CA used to verify client certificates.
pub fn build_acceptor(
    cert_path: &str,
    key_path: &str,
    client_ca_path: &str,
    min_version: TlsMinVersion,
) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(client_ca_path)? {
        roots
            .add(cert)
            .map_err(|err| ConfigError::PartialTls(format!("invalid client CA: {err}")))?;
    }
    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| ConfigError::PartialTls(format!("invalid client CA: {err}")))?;

    let versions: &[&'static tokio_rustls::rustls::SupportedProtocolVersion] = match min_version {
        TlsMinVersion::V1_2 => &[
            &tokio_rustls::rustls::version::TLS12,
            &tokio_rustls::rustls::version::TLS13,
        ],
        TlsMinVersion::V1_3 => &[&tokio_rustls::rustls::version::TLS13],
    };

    let config = ServerConfig::builder_with_protocol_versions(versions)
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
