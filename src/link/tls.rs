//! TLS settings and rustls configuration builders.

use crate::error::Error;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// TLS settings for a listener or a connector.
///
/// All fields point at PEM files. A listener needs `certfile` and `keyfile`;
/// a connector needs `ca_certs` to verify the server, and optionally a
/// `server_name` when the certificate is issued for a DNS name rather than
/// the target IP address.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Certificate chain presented to connecting peers.
    pub certfile: Option<String>,
    /// Private key matching `certfile`.
    pub keyfile: Option<String>,
    /// Trusted root certificates used to verify the server.
    pub ca_certs: Option<String>,
    /// Name to verify the server certificate against; defaults to the
    /// connector's target IP address.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Builds the rustls server configuration for a TLS listener.
    pub(super) fn build_server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        let (Some(certfile), Some(keyfile)) = (&self.certfile, &self.keyfile) else {
            return Err(Error::TlsServerConfigMissing);
        };
        let certs = load_certs(certfile)?;
        let key = load_private_key(keyfile)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| Error::TlsServerConfigBuild(err.to_string()))?;
        debug!(certfile, keyfile, "built TLS server config");
        Ok(Arc::new(config))
    }

    /// Builds the rustls client configuration for a TLS connector.
    pub(super) fn build_client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let Some(ca_certs) = &self.ca_certs else {
            return Err(Error::TlsClientConfigMissing);
        };
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_certs)? {
            roots
                .add(cert)
                .map_err(|err| Error::TlsInvalidCertificate(err.to_string()))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        debug!(ca_certs, "built TLS client config");
        Ok(Arc::new(config))
    }

    /// Resolves the name the server certificate is verified against.
    pub(super) fn server_name(&self, address: SocketAddr) -> Result<ServerName<'static>, Error> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|_| Error::TlsInvalidServerName(name.clone())),
            None => Ok(ServerName::IpAddress(address.ip().into())),
        }
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|source| Error::TlsCertificateLoad {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| Error::TlsInvalidCertificate(err.to_string()))?;
    if certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|source| Error::TlsKeyLoad {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| Error::TlsInvalidKey(err.to_string()))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("no private key found in {path}")))
}
