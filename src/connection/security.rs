//! TLS context for Spine connections.
//!
//! Spine requires mutual TLS: we verify Spine's certificate against the NHS
//! root and present our own endpoint certificate, and the listener demands a
//! client certificate from inbound peers. The same context issues outbound
//! connections and accepts inbound ones. A context built without TLS
//! material produces cleartext sockets, which is only useful against a local
//! test harness.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::config::TlsConfig;

/// A byte stream to a peer, TLS or cleartext.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

enum Mode {
    Tls {
        connector: TlsConnector,
        acceptor: TlsAcceptor,
    },
    Cleartext,
}

pub struct SpineSecurityContext {
    mode: Mode,
}

impl SpineSecurityContext {
    pub fn new(tls: Option<&TlsConfig>) -> anyhow::Result<SpineSecurityContext> {
        let Some(tls) = tls else {
            debug!("no TLS material configured, using cleartext sockets");
            return Ok(SpineSecurityContext { mode: Mode::Cleartext });
        };

        let ca_certs = read_certs(&tls.ca_certificates)?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).context("adding CA certificate to trust store")?;
        }
        let roots = Arc::new(roots);
        let chain = read_certs(&tls.certificate_chain)?;
        let key = read_key(&tls.private_key)?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(chain.clone(), key.clone_key())
            .context("building TLS client configuration")?;

        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .context("building client certificate verifier")?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .context("building TLS server configuration")?;

        Ok(SpineSecurityContext {
            mode: Mode::Tls {
                connector: TlsConnector::from(Arc::new(client_config)),
                acceptor: TlsAcceptor::from(Arc::new(server_config)),
            },
        })
    }

    /// Open a connection to the given host, completing the TLS handshake
    /// when the context carries TLS material.
    pub async fn connect(&self, host: &str, port: u16) -> anyhow::Result<BoxedConnection> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {}:{}", host, port))?;
        match &self.mode {
            Mode::Tls { connector, .. } => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| anyhow!("invalid TLS server name: {}", host))?;
                let tls = connector.connect(name, stream).await?;
                Ok(Box::new(tls))
            }
            Mode::Cleartext => Ok(Box::new(stream)),
        }
    }

    /// Complete the server side of an accepted connection.
    pub async fn accept(&self, stream: TcpStream) -> anyhow::Result<BoxedConnection> {
        match &self.mode {
            Mode::Tls { acceptor, .. } => {
                let tls = acceptor.accept(stream).await?;
                Ok(Box::new(tls))
            }
            Mode::Cleartext => Ok(Box::new(stream)),
        }
    }
}

fn read_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("reading private key from {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cleartext_context_builds_without_material() {
        assert!(SpineSecurityContext::new(None).is_ok());
    }

    #[test]
    fn test_missing_files_are_reported() {
        let tls = TlsConfig {
            ca_certificates: "/nonexistent/ca.pem".into(),
            certificate_chain: "/nonexistent/chain.pem".into(),
            private_key: "/nonexistent/key.pem".into(),
        };
        let err = match SpineSecurityContext::new(Some(&tls)) {
            Ok(_) => panic!("context built from missing files"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        File::create(&empty).unwrap().write_all(b"").unwrap();
        let tls = TlsConfig {
            ca_certificates: empty.clone(),
            certificate_chain: empty.clone(),
            private_key: empty,
        };
        assert!(SpineSecurityContext::new(Some(&tls)).is_err());
    }
}
