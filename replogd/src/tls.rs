//! Mutual TLS setup
//!
//! Both sides of every connection present a certificate signed by the
//! cluster CA. The client certificate's common name is the subject
//! used for authorization.
use std::{fs, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::rustls::{
    self,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::{ConfigError, ConfigFiles, ConfigResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Tls(e.to_string())
}

fn open(path: &Path) -> ConfigResult<BufReader<fs::File>> {
    fs::File::open(path)
        .map(BufReader::new)
        .map_err(|e| ConfigError::io(path, e))
}

pub fn load_certs(path: &Path) -> ConfigResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::io(path, e))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> ConfigResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| ConfigError::io(path, e))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key in {}", path.display())))
}

fn load_roots(ca_file: &Path) -> ConfigResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert).map_err(tls_err)?;
    }
    Ok(roots)
}

/// Server side: require a client certificate signed by the CA
pub fn server_config(ca_file: &Path, cert_file: &Path, key_file: &Path) -> ConfigResult<Arc<ServerConfig>> {
    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca_file)?), provider.clone())
            .build()
            .map_err(tls_err)?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert_file)?, load_private_key(key_file)?)
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

/// Client side: verify the server against the CA, present our own certificate
pub fn client_config(ca_file: &Path, cert_file: &Path, key_file: &Path) -> ConfigResult<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_root_certificates(load_roots(ca_file)?)
        .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

/// TLS configuration of a node
#[derive(Debug, Clone)]
pub struct TlsParams {
    /// For accepting connections
    pub server: Arc<ServerConfig>,
    /// For connecting to other nodes
    pub client: Arc<ClientConfig>,
}

impl TlsParams {
    /// Serve with the server certificate, talk to peers as the root client
    pub fn load(files: &ConfigFiles) -> ConfigResult<Self> {
        Ok(Self {
            server: server_config(
                &files.ca_file,
                &files.server_cert_file,
                &files.server_key_file,
            )?,
            client: client_config(
                &files.ca_file,
                &files.root_client_cert_file,
                &files.root_client_key_file,
            )?,
        })
    }
}

/// Common name of the first certificate, or `""` if there's none
pub fn subject(certs: Option<&[CertificateDer<'_>]>) -> String {
    let Some(cert) = certs.and_then(|certs| certs.first()) else {
        return String::new();
    };
    let Ok((_, cert)) = X509Certificate::from_der(cert.as_ref()) else {
        return String::new();
    };
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_owned();
    cn
}
