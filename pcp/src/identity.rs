//! Client identities derived from X.509 certificates.

use crate::{ClientError, Result};

/// The subject common name of a DER encoded certificate.
pub fn common_name(der: &[u8]) -> Result<String> {
    let (_, certificate) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ClientError::Identity(format!("invalid certificate: {e}")))?;
    let attribute = certificate
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| ClientError::Identity("certificate subject has no common name".into()))?;
    let name = attribute
        .as_str()
        .map_err(|e| ClientError::Identity(format!("unreadable common name: {e}")))?;
    Ok(name.to_string())
}

/// `pcp://<common-name>/<client-type>`
pub fn derive(der: &[u8], client_type: &str) -> Result<String> {
    Ok(format!("pcp://{}/{client_type}", common_name(der)?))
}

#[cfg(test)]
mod tests {
    use broker::pki::Pki;
    use transport::TlsConfig;

    use super::*;

    #[test]
    fn identity_from_common_name() {
        let pki = Pki::new("Test CA").unwrap();
        let alice = pki.issue("alice", &[]).unwrap();
        let tls = TlsConfig::builder()
            .ca_cert_pem(pki.ca_pem())
            .cert_pem(alice.cert_pem)
            .key_pem(alice.key_pem)
            .build()
            .unwrap();

        let certificate = tls.certificate().unwrap();
        assert_eq!(common_name(certificate).unwrap(), "alice");
        assert_eq!(derive(certificate, "agent").unwrap(), "pcp://alice/agent");
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(matches!(
            derive(b"definitely not DER", "agent"),
            Err(ClientError::Identity(_))
        ));
    }
}
