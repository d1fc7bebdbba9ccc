//! TLS configuration for mutually authenticated broker connections.
//!
//! A [`TlsConfig`] is built once from PEM material and shared (it is cheap to
//! clone) by every connection attempt. Server certificates are checked
//! against the configured CA, the configured CRLs and the requested hostname
//! unless verification is switched off.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};

use crate::error::{Result, TransportError};

/// TLS settings for a client connection.
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
    certificate: Option<CertificateDer<'static>>,
    verify_peer: bool,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("has_client_certificate", &self.certificate.is_some())
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    ca_cert_pem: Option<Vec<u8>>,
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
    crl_pems: Vec<Vec<u8>>,
    verify_peer: bool,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsConfigBuilder {
    /// Creates a builder with peer verification enabled and no material.
    pub const fn new() -> Self {
        Self {
            ca_cert_pem: None,
            cert_pem: None,
            key_pem: None,
            crl_pems: Vec::new(),
            verify_peer: true,
        }
    }

    /// Sets the CA certificate(s) that server certificates must chain to.
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Sets the client certificate chain presented to the broker.
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    /// Sets the private key matching [`Self::cert_pem`].
    pub fn key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key_pem = Some(pem.into());
        self
    }

    /// Adds a certificate revocation list. When at least one CRL is set the
    /// revocation status of the server chain must be known and good.
    pub fn crl_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.crl_pems.push(pem.into());
        self
    }

    /// Enables or disables server certificate verification (on by default).
    ///
    /// With verification off, neither the chain nor the hostname is checked.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<TlsConfig> {
        let provider = Arc::new(ring::default_provider());

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsConfig(format!("protocol versions: {e}")))?;

        let builder = if self.verify_peer {
            let ca_pem = self.ca_cert_pem.ok_or_else(|| {
                TransportError::TlsConfig("CA certificate required to verify peers".into())
            })?;
            let mut roots = RootCertStore::empty();
            for cert in parse_certificates(&ca_pem)? {
                roots.add(cert).map_err(|e| {
                    TransportError::TlsConfig(format!("failed to add CA certificate: {e}"))
                })?;
            }
            if roots.is_empty() {
                return Err(TransportError::TlsConfig("no CA certificates found".into()));
            }

            let mut crls = Vec::new();
            for pem in &self.crl_pems {
                crls.extend(parse_crls(pem)?);
            }

            let mut verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
            if !crls.is_empty() {
                verifier = verifier.with_crls(crls);
            }
            let verifier = verifier
                .build()
                .map_err(|e| TransportError::TlsConfig(format!("server verifier: {e}")))?;
            builder.with_webpki_verifier(verifier)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        };

        let (client_config, certificate) = match (self.cert_pem, self.key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let chain = parse_certificates(&cert_pem)?;
                let leaf = chain.first().cloned().ok_or_else(|| {
                    TransportError::TlsConfig("no client certificates found".into())
                })?;
                let key = PrivateKeyDer::from_pem_slice(&key_pem)
                    .map_err(|e| TransportError::TlsConfig(format!("private key: {e}")))?;
                let config = builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TransportError::TlsConfig(format!("client certificate: {e}")))?;
                (config, Some(leaf))
            }
            (None, None) => (builder.with_no_client_auth(), None),
            _ => {
                return Err(TransportError::TlsConfig(
                    "client certificate and private key must be supplied together".into(),
                ))
            }
        };

        Ok(TlsConfig {
            client_config: Arc::new(client_config),
            certificate,
            verify_peer: self.verify_peer,
        })
    }
}

impl TlsConfig {
    /// Creates a new TLS configuration builder.
    pub const fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// The leaf client certificate, if one was configured.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificate.as_ref()
    }

    /// Whether server certificates (and hostnames) are verified.
    pub fn verifies_peer(&self) -> bool {
        self.verify_peer
    }

    /// Starts a client-side TLS session expecting `hostname` as server name.
    pub(crate) fn session(&self, hostname: &str) -> std::result::Result<ClientConnection, String> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| format!("invalid server name \"{hostname}\": {e}"))?;
        ClientConnection::new(Arc::clone(&self.client_config), server_name)
            .map_err(|e| e.to_string())
    }
}

/// Turns a handshake failure into the message carried by
/// [`TransportError::Tls`].
pub(crate) fn describe_handshake_error(hostname: &str, error: &rustls::Error) -> String {
    match error {
        rustls::Error::InvalidCertificate(cert_error) => {
            let detail = match cert_error {
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. } => {
                    return format!(
                        "hostname \"{hostname}\" does not match the server certificate"
                    );
                }
                CertificateError::Revoked => "certificate revoked".to_string(),
                CertificateError::UnknownIssuer => "unknown issuer".to_string(),
                CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                    "certificate expired".to_string()
                }
                other => format!("{other:?}"),
            };
            format!("certificate verify failed: {detail}")
        }
        other => other.to_string(),
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsConfig(format!("failed to parse certificates: {e}")))
}

fn parse_crls(pem: &[u8]) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let crls = CertificateRevocationListDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsConfig(format!("failed to parse CRL: {e}")))?;
    if crls.is_empty() {
        return Err(TransportError::TlsConfig("no CRLs found in PEM input".into()));
    }
    Ok(crls)
}

/// Verifier used when peer verification is switched off. Handshake
/// signatures are still checked so the session keys are sound.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
