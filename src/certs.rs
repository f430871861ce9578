use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::time::ASN1Time;

use crate::errors::{Error, Result};

/* ============================= CONSTANTS ============================= */

pub const CA_COMMON_NAME: &str = "kubewarden-controller-ca";

/// Validity window of a freshly generated CA.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity window of a freshly generated serving certificate.
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Certificates are rotated this long before they actually expire.
pub const ROTATION_LOOKAHEAD_DAYS: i64 = 60;

pub fn rotation_lookahead() -> Duration {
    Duration::days(ROTATION_LOOKAHEAD_DAYS)
}

/* ============================= TYPES ============================= */

/// A PEM-encoded certificate together with its PEM-encoded private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A set of trusted root certificates, DER-encoded.
#[derive(Debug, Clone, Default)]
pub struct CertPool {
    roots: Vec<Vec<u8>>,
}

impl CertPool {
    /// Accepts one or more concatenated PEM certificate blocks.
    pub fn from_pem(concatenated: &str) -> Result<Self> {
        let mut roots = Vec::new();
        for pem in Pem::iter_from_buffer(concatenated.as_bytes()) {
            let pem = pem.map_err(|e| Error::Certificate(format!("invalid PEM block: {e}")))?;
            if pem.label != "CERTIFICATE" {
                return Err(Error::Certificate(format!(
                    "unexpected PEM label {:?} in certificate pool",
                    pem.label
                )));
            }
            roots.push(pem.contents);
        }
        if roots.is_empty() {
            return Err(Error::Certificate(
                "certificate pool contains no certificates".to_string(),
            ));
        }
        Ok(CertPool { roots })
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn verifies(&self, cert: &X509Certificate) -> bool {
        self.roots.iter().any(|root_der| {
            let Ok((_, root)) = x509_parser::parse_x509_certificate(root_der) else {
                return false;
            };
            cert.verify_signature(Some(root.public_key())).is_ok()
        })
    }
}

/* ============================= GENERATION ============================= */

fn random_serial() -> SerialNumber {
    SerialNumber::from(rand::random::<[u8; 16]>().to_vec())
}

/// Generate a self-signed ECDSA-P256 certificate authority.
pub fn generate_ca(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<CertificatePair> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;

    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key = KeyPair::generate().map_err(rcgen_error)?;
    let cert = params.self_signed(&key).map_err(rcgen_error)?;

    Ok(CertificatePair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a leaf serving certificate signed by `ca`, with `dns_name` as
/// common name and sole subject alternative name.
pub fn generate_cert(
    ca: &CertificatePair,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    dns_name: &str,
) -> Result<CertificatePair> {
    let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(rcgen_error)?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem).map_err(rcgen_error)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(rcgen_error)?;

    let mut params = CertificateParams::new(vec![dns_name.to_string()]).map_err(rcgen_error)?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params.distinguished_name.push(DnType::CommonName, dns_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key = KeyPair::generate().map_err(rcgen_error)?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(rcgen_error)?;

    Ok(CertificatePair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn rcgen_error(e: rcgen::Error) -> Error {
    Error::Certificate(e.to_string())
}

/* ============================= VERIFICATION ============================= */

/// Verify that `pair` is a parsable, self-signed CA whose validity window
/// covers `at` and whose private key matches the certificate.
pub fn verify_ca(pair: &CertificatePair, at: OffsetDateTime) -> Result<()> {
    check_private_key_kind(&pair.key_pem)?;

    let (_, pem) = parse_x509_pem(pair.cert_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("cannot decode CA PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("cannot parse CA certificate: {e}")))?;

    check_key_matches(&cert, &pair.key_pem)?;
    check_valid_at(&cert, at)?;

    let is_ca = cert
        .basic_constraints()
        .map_err(|e| Error::Certificate(format!("cannot read basicConstraints: {e}")))?
        .is_some_and(|bc| bc.value.ca);
    if !is_ca {
        return Err(Error::Certificate(
            "certificate is not a certificate authority".to_string(),
        ));
    }

    cert.verify_signature(None)
        .map_err(|e| Error::Certificate(format!("CA self-signature check failed: {e}")))?;

    Ok(())
}

/// Verify that `pair` is a parsable serving certificate whose validity window
/// covers `at`, whose private key matches, whose SANs contain `dns_name`, and
/// which chains to one of the roots in `pool`.
pub fn verify_cert(
    pair: &CertificatePair,
    pool: &CertPool,
    dns_name: &str,
    at: OffsetDateTime,
) -> Result<()> {
    check_private_key_kind(&pair.key_pem)?;

    let (_, pem) = parse_x509_pem(pair.cert_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("cannot decode certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("cannot parse certificate: {e}")))?;

    check_key_matches(&cert, &pair.key_pem)?;
    check_valid_at(&cert, at)?;

    let san_matches = cert
        .subject_alternative_name()
        .map_err(|e| Error::Certificate(format!("cannot read subjectAltName: {e}")))?
        .is_some_and(|san| {
            san.value.general_names.iter().any(|name| {
                matches!(name, x509_parser::extensions::GeneralName::DNSName(d) if *d == dns_name)
            })
        });
    if !san_matches {
        return Err(Error::Certificate(format!(
            "certificate does not carry DNS name {dns_name}"
        )));
    }

    if !pool.verifies(&cert) {
        return Err(Error::Certificate(
            "certificate does not chain to a trusted root".to_string(),
        ));
    }

    Ok(())
}

fn check_valid_at(cert: &X509Certificate, at: OffsetDateTime) -> Result<()> {
    let at = ASN1Time::from_timestamp(at.unix_timestamp())
        .map_err(|e| Error::Certificate(format!("invalid verification time: {e}")))?;
    if !cert.validity().is_valid_at(at) {
        return Err(Error::Certificate(format!(
            "certificate is not valid at {at} (notBefore {}, notAfter {})",
            cert.validity().not_before,
            cert.validity().not_after
        )));
    }
    Ok(())
}

/// The controller only ever issues EC keys. SEC1 (`EC PRIVATE KEY`) and
/// PKCS#8 (`PRIVATE KEY`) envelopes are accepted; anything else means the
/// secret was tampered with or written by an incompatible version.
fn check_private_key_kind(key_pem: &str) -> Result<()> {
    let mut reader = std::io::BufReader::new(key_pem.as_bytes());
    match rustls_pemfile::read_one(&mut reader) {
        Ok(Some(rustls_pemfile::Item::Sec1Key(_))) | Ok(Some(rustls_pemfile::Item::Pkcs8Key(_))) => {
            Ok(())
        }
        Ok(Some(rustls_pemfile::Item::Pkcs1Key(_))) => Err(Error::Certificate(
            "RSA private keys are not supported".to_string(),
        )),
        Ok(Some(_)) | Ok(None) => Err(Error::Certificate(
            "PEM block is not a private key".to_string(),
        )),
        Err(e) => Err(Error::Certificate(format!("cannot decode key PEM: {e}"))),
    }
}

fn check_key_matches(cert: &X509Certificate, key_pem: &str) -> Result<()> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| Error::Certificate(format!("cannot parse private key: {e}")))?;
    if cert.public_key().raw != key.public_key_der() {
        return Err(Error::Certificate(
            "private key does not match certificate".to_string(),
        ));
    }
    Ok(())
}

/* ============================= ROTATION ============================= */

/// True when the CA pair is missing, invalid, or expires within the rotation
/// window. Failures are logged, not propagated: an unreadable CA is simply
/// rotated away.
pub fn ca_needs_rotation(pair: &CertificatePair, now: OffsetDateTime) -> bool {
    match verify_ca(pair, now + rotation_lookahead()) {
        Ok(()) => false,
        Err(e) => {
            warn!(error = %e, "ca_verification_failed");
            true
        }
    }
}

/// True when the serving cert is invalid for `dns_name` against `ca` or
/// expires within the rotation window.
pub fn cert_needs_rotation(
    pair: &CertificatePair,
    ca_cert_pem: &str,
    dns_name: &str,
    now: OffsetDateTime,
) -> bool {
    let pool = match CertPool::from_pem(ca_cert_pem) {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "ca_pool_unreadable");
            return true;
        }
    };
    match verify_cert(pair, &pool, dns_name, now + rotation_lookahead()) {
        Ok(()) => false,
        Err(e) => {
            warn!(error = %e, "server_cert_verification_failed");
            true
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_window() -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now, now + Duration::days(CA_VALIDITY_DAYS))
    }

    fn cert_window() -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now, now + Duration::days(CERT_VALIDITY_DAYS))
    }

    #[test]
    fn test_generated_ca_verifies() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
        verify_ca(&ca, OffsetDateTime::now_utc()).unwrap();
    }

    #[test]
    fn test_generated_cert_verifies_against_its_ca() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        let (nb, na) = cert_window();
        let cert = generate_cert(&ca, nb, na, "policy-server-default.kubewarden.svc").unwrap();

        let pool = CertPool::from_pem(&ca.cert_pem).unwrap();
        verify_cert(
            &cert,
            &pool,
            "policy-server-default.kubewarden.svc",
            OffsetDateTime::now_utc(),
        )
        .unwrap();
    }

    #[test]
    fn test_cert_rejected_for_wrong_dns_name() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        let (nb, na) = cert_window();
        let cert = generate_cert(&ca, nb, na, "policy-server-default.kubewarden.svc").unwrap();

        let pool = CertPool::from_pem(&ca.cert_pem).unwrap();
        let err = verify_cert(
            &cert,
            &pool,
            "policy-server-other.kubewarden.svc",
            OffsetDateTime::now_utc(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("DNS name"));
    }

    #[test]
    fn test_cert_rejected_against_foreign_ca() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        let other_ca = generate_ca(nb, na).unwrap();
        let (nb, na) = cert_window();
        let cert = generate_cert(&ca, nb, na, "policy-server-default.kubewarden.svc").unwrap();

        let pool = CertPool::from_pem(&other_ca.cert_pem).unwrap();
        let err = verify_cert(
            &cert,
            &pool,
            "policy-server-default.kubewarden.svc",
            OffsetDateTime::now_utc(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("trusted root"));
    }

    #[test]
    fn test_verification_fails_after_expiry() {
        let now = OffsetDateTime::now_utc();
        let ca = generate_ca(now, now + Duration::days(CA_VALIDITY_DAYS)).unwrap();
        let cert = generate_cert(
            &ca,
            now,
            now + Duration::days(30),
            "policy-server-default.kubewarden.svc",
        )
        .unwrap();

        let pool = CertPool::from_pem(&ca.cert_pem).unwrap();
        let err = verify_cert(
            &cert,
            &pool,
            "policy-server-default.kubewarden.svc",
            now + Duration::days(31),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not valid at"));
    }

    #[test]
    fn test_key_mismatch_detected() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        let other = generate_ca(nb, na).unwrap();

        let mixed = CertificatePair {
            cert_pem: ca.cert_pem.clone(),
            key_pem: other.key_pem.clone(),
        };
        let err = verify_ca(&mixed, OffsetDateTime::now_utc()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_garbage_key_rejected() {
        let (nb, na) = ca_window();
        let ca = generate_ca(nb, na).unwrap();
        let broken = CertificatePair {
            cert_pem: ca.cert_pem.clone(),
            key_pem: "not a key".to_string(),
        };
        assert!(verify_ca(&broken, OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_pool_accepts_concatenated_pem_blocks() {
        let (nb, na) = ca_window();
        let ca1 = generate_ca(nb, na).unwrap();
        let ca2 = generate_ca(nb, na).unwrap();
        let bundle = format!("{}{}", ca1.cert_pem, ca2.cert_pem);

        let pool = CertPool::from_pem(&bundle).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_pool_rejects_empty_input() {
        assert!(CertPool::from_pem("").is_err());
    }

    #[test]
    fn test_ca_rotation_lookahead() {
        let now = OffsetDateTime::now_utc();
        // Expires within the rotation window → must rotate.
        let short = generate_ca(now, now + Duration::days(ROTATION_LOOKAHEAD_DAYS - 1)).unwrap();
        assert!(ca_needs_rotation(&short, now));

        // Plenty of runway → keep.
        let long = generate_ca(now, now + Duration::days(CA_VALIDITY_DAYS)).unwrap();
        assert!(!ca_needs_rotation(&long, now));
    }

    #[test]
    fn test_cert_rotation_on_dns_mismatch() {
        let now = OffsetDateTime::now_utc();
        let ca = generate_ca(now, now + Duration::days(CA_VALIDITY_DAYS)).unwrap();
        let cert = generate_cert(
            &ca,
            now,
            now + Duration::days(CERT_VALIDITY_DAYS),
            "policy-server-old.kubewarden.svc",
        )
        .unwrap();

        assert!(cert_needs_rotation(
            &cert,
            &ca.cert_pem,
            "policy-server-new.kubewarden.svc",
            now
        ));
        assert!(!cert_needs_rotation(
            &cert,
            &ca.cert_pem,
            "policy-server-old.kubewarden.svc",
            now
        ));
    }
}
