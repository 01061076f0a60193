//! TLS material for broker connections
//!
//! Certificates are read and parsed once at startup so that unreadable or malformed
//! material stops the gateway before it opens a socket. The validated PEM bytes are
//! then handed to rumqttc on every (re)connect.

use crate::config::{validate_client_identity, SessionConfig};
use crate::error::{GatewayError, GatewayResult};
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Client certificate and key presented to the broker
#[derive(Clone)]
pub struct ClientIdentity {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

/// Verified trust anchors plus an optional client identity
#[derive(Clone)]
pub struct TlsContext {
    ca_pem: Vec<u8>,
    ca_cert_count: usize,
    client_identity: Option<ClientIdentity>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("ca_cert_count", &self.ca_cert_count)
            .field("mutual_auth", &self.client_identity.is_some())
            .finish()
    }
}

impl TlsContext {
    /// Build TLS material from file paths
    ///
    /// Returns `Ok(None)` when no CA path is given: the session then runs in
    /// plaintext. The cert/key pairing is checked before any file is read.
    pub fn build(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> GatewayResult<Option<Self>> {
        validate_client_identity(client_cert_path, client_key_path)?;

        let Some(ca_path) = ca_path else {
            if client_cert_path.is_some() {
                warn!("Client certificate configured without a CA certificate; TLS disabled");
            }
            return Ok(None);
        };

        let ca_pem = read_pem(ca_path)?;
        let ca_cert_count = count_certificates(ca_path, &ca_pem)?;

        let client_identity = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = read_pem(cert_path)?;
                count_certificates(cert_path, &cert_pem)?;
                let key_pem = read_pem(key_path)?;
                check_private_key(key_path, &key_pem)?;
                Some(ClientIdentity { cert_pem, key_pem })
            }
            _ => None,
        };

        info!(
            ca = %ca_path.display(),
            ca_cert_count,
            mutual_auth = client_identity.is_some(),
            "Loaded TLS material"
        );

        Ok(Some(Self {
            ca_pem,
            ca_cert_count,
            client_identity,
        }))
    }

    /// Build TLS material from the paths held in a session configuration
    pub fn from_session(config: &SessionConfig) -> GatewayResult<Option<Self>> {
        Self::build(
            config.ca_cert_path.as_deref(),
            config.client_cert_path.as_deref(),
            config.client_key_path.as_deref(),
        )
    }

    /// Number of trust anchors in the CA bundle
    pub fn ca_cert_count(&self) -> usize {
        self.ca_cert_count
    }

    /// Whether the gateway presents its own certificate to the broker
    pub fn is_mutual(&self) -> bool {
        self.client_identity.is_some()
    }

    /// rumqttc transport using this material
    pub fn to_transport(&self) -> RumqttcTransport {
        let client_auth = self
            .client_identity
            .as_ref()
            .map(|identity| (identity.cert_pem.clone(), identity.key_pem.clone()));

        RumqttcTransport::Tls(TlsConfiguration::Simple {
            ca: self.ca_pem.clone(),
            alpn: None,
            client_auth,
        })
    }
}

fn read_pem(path: &Path) -> GatewayResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| GatewayError::certificate_load(path, e.to_string()))
}

fn count_certificates(path: &Path, pem: &[u8]) -> GatewayResult<usize> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::certificate_load(path, format!("invalid PEM: {e}")))?;

    if certs.is_empty() {
        return Err(GatewayError::certificate_load(
            path,
            "no certificates found",
        ));
    }

    for (index, der) in certs.iter().enumerate() {
        X509Certificate::from_der(der.as_ref()).map_err(|e| {
            GatewayError::certificate_load(
                path,
                format!("certificate #{index} is not valid X.509: {e}"),
            )
        })?;
    }
    Ok(certs.len())
}

fn check_private_key(path: &Path, pem: &[u8]) -> GatewayResult<()> {
    let mut reader = BufReader::new(pem);
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(GatewayError::certificate_load(path, "no private key found")),
        Err(e) => Err(GatewayError::certificate_load(
            path,
            format!("invalid PEM: {e}"),
        )),
    }
}
