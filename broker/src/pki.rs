//! A throwaway certificate authority.
//!
//! Everything is generated in memory: a self-signed CA, leaf certificates it
//! signs (usable as broker or client identities) and revocation lists.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::WrapErr;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams, DnType,
    IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason, RevokedCertParams, SanType,
    SerialNumber,
};
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

/// A certificate and its private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    serial: u64,
}

/// Certificate authority for a single test.
pub struct Pki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    next_serial: AtomicU64,
}

impl Pki {
    /// Generates a fresh CA named `common_name`.
    pub fn new(common_name: &str) -> eyre::Result<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(1u64));

        let ca_key = KeyPair::generate().wrap_err("generating CA key")?;
        let ca_cert = params.self_signed(&ca_key).wrap_err("self-signing CA")?;
        Ok(Self {
            ca_cert,
            ca_key,
            next_serial: AtomicU64::new(2),
        })
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Issues a leaf certificate for `common_name`, valid for the given DNS
    /// names and IP addresses.
    pub fn issue(&self, common_name: &str, names: &[&str]) -> eyre::Result<Identity> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.serial_number = Some(SerialNumber::from(serial));
        for name in names {
            let san = match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName((*name).try_into().wrap_err("invalid DNS name")?),
            };
            params.subject_alt_names.push(san);
        }

        let key = KeyPair::generate().wrap_err("generating leaf key")?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .wrap_err_with(|| format!("signing certificate for {common_name}"))?;
        Ok(Identity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            serial,
        })
    }

    /// A CRL signed by this CA listing `revoked`. An empty slice gives a
    /// valid CRL that revokes nothing.
    pub fn crl(&self, revoked: &[&Identity]) -> eyre::Result<String> {
        let revoked_certs = revoked
            .iter()
            .map(|identity| RevokedCertParams {
                serial_number: SerialNumber::from(identity.serial),
                revocation_time: rcgen::date_time_ymd(2024, 6, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            })
            .collect();

        let params = CertificateRevocationListParams {
            this_update: rcgen::date_time_ymd(2024, 1, 1),
            next_update: rcgen::date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params
            .signed_by(&self.ca_cert, &self.ca_key)
            .wrap_err("signing CRL")?;
        crl.pem().wrap_err("encoding CRL")
    }

    /// Server-side TLS configuration presenting `identity`. With
    /// `require_client_cert` the client must present a certificate issued by
    /// this CA.
    pub fn server_config(
        &self,
        identity: &Identity,
        require_client_cert: bool,
    ) -> eyre::Result<Arc<ServerConfig>> {
        let provider = Arc::new(ring::default_provider());
        let chain = CertificateDer::pem_slice_iter(identity.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("parsing broker certificate")?;
        let key = PrivateKeyDer::from_pem_slice(identity.key_pem.as_bytes())
            .wrap_err("parsing broker key")?;

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .wrap_err("protocol versions")?;
        let builder = if require_client_cert {
            let mut roots = RootCertStore::empty();
            roots.add(self.ca_der()).wrap_err("adding CA")?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .wrap_err("client verifier")?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(chain, key)
            .wrap_err("broker certificate")?;
        Ok(Arc::new(config))
    }
}
