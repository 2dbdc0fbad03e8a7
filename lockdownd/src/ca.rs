//! Certificate authority for pair records.
//!
//! Pairing hands the device three PEM blobs: a certificate wrapping the
//! device's own RSA public key, the host certificate, and the root that
//! signed both. The root and host material is provisioned once per host and
//! reused forever; only the device certificate is minted per pairing.

use std::time::Duration;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::SigningKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding, SubjectPublicKeyInfo},
};
use sha2::Sha256;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::EncodePem,
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
};

use crate::{LockdownError, prefs::PreferenceStore};

/// Pair records outlive most devices; the device only checks the validity
/// window, so certificates get ten years.
const CERT_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

const RSA_BITS: usize = 2048;

/// The three PEM blobs a pair record carries.
#[derive(Clone, Debug)]
pub struct PairCertificates {
    pub device_cert_pem: Vec<u8>,
    pub host_cert_pem: Vec<u8>,
    pub root_cert_pem: Vec<u8>,
}

/// Freshly generated host key material, PEM-encoded for persistence.
pub(crate) struct HostCredentials {
    pub root_key_pem: Vec<u8>,
    pub root_cert_pem: Vec<u8>,
    pub host_key_pem: Vec<u8>,
    pub host_cert_pem: Vec<u8>,
}

fn crypto_err(e: impl std::fmt::Display) -> LockdownError {
    LockdownError::Crypto(e.to_string())
}

/// Parses the public key a device returns for `DevicePublicKey`: PKCS#1,
/// normally as PEM text, occasionally as raw DER.
pub(crate) fn parse_device_public_key(blob: &[u8]) -> Result<RsaPublicKey, LockdownError> {
    if blob.is_empty() {
        return Err(LockdownError::InvalidArgument);
    }
    if blob.trim_ascii_start().starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(blob).map_err(|_| LockdownError::InvalidArgument)?;
        RsaPublicKey::from_pkcs1_pem(text).map_err(crypto_err)
    } else {
        RsaPublicKey::from_pkcs1_der(blob).map_err(crypto_err)
    }
}

fn issue_cert(
    profile: Profile,
    serial: &[u8],
    signing_key: &RsaPrivateKey,
    subject_public_key: &RsaPublicKey,
) -> Result<Certificate, LockdownError> {
    let validity = Validity::from_now(CERT_LIFETIME).map_err(crypto_err)?;
    let signer = SigningKey::<Sha256>::new(signing_key.clone());
    let spki = SubjectPublicKeyInfo::from_key(subject_public_key.clone()).map_err(crypto_err)?;

    let builder = CertificateBuilder::new(
        profile,
        SerialNumber::new(serial).map_err(crypto_err)?,
        validity,
        Name::default(),
        spki,
        &signer,
    )
    .map_err(crypto_err)?;

    builder.build().map_err(crypto_err)
}

fn leaf_profile() -> Profile {
    Profile::Leaf {
        issuer: Name::default(),
        enable_key_agreement: false,
        enable_key_encipherment: true,
    }
}

fn cert_pem(cert: &Certificate) -> Result<Vec<u8>, LockdownError> {
    Ok(cert.to_pem(LineEnding::LF).map_err(crypto_err)?.into_bytes())
}

fn key_pem(key: &RsaPrivateKey) -> Result<Vec<u8>, LockdownError> {
    Ok(key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(crypto_err)?
        .as_bytes()
        .to_vec())
}

/// Generates the host's persistent key material: a self-signed root and a
/// host certificate signed by it. Called once per host by the preference
/// store.
pub(crate) fn generate_host_credentials() -> Result<HostCredentials, LockdownError> {
    let mut rng = rand_core::OsRng;
    let root_key = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(crypto_err)?;
    let host_key = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(crypto_err)?;

    let root_cert = issue_cert(
        Profile::Root,
        &[1],
        &root_key,
        &RsaPublicKey::from(&root_key),
    )?;
    let host_cert = issue_cert(leaf_profile(), &[1], &root_key, &RsaPublicKey::from(&host_key))?;

    Ok(HostCredentials {
        root_key_pem: key_pem(&root_key)?,
        root_cert_pem: cert_pem(&root_cert)?,
        host_key_pem: key_pem(&host_key)?,
        host_cert_pem: cert_pem(&host_cert)?,
    })
}

/// Issues the certificates for a pair record.
///
/// The device certificate wraps the device's own public key: version 3, a
/// single zero serial byte, CA:FALSE, valid from now for ten years, signed by
/// the host's root. The host and root certificates come back verbatim from
/// the preference store, which provisions them on first use.
pub fn generate_pair_certificates(
    device_public_key: &[u8],
    store: &PreferenceStore,
) -> Result<PairCertificates, LockdownError> {
    let device_key = parse_device_public_key(device_public_key)?;

    let identity = store.identity()?;
    let root_key_text = std::str::from_utf8(&identity.root_key_pem)
        .map_err(|_| LockdownError::InvalidConfiguration)?;
    let root_key = RsaPrivateKey::from_pkcs8_pem(root_key_text)
        .map_err(|_| LockdownError::InvalidConfiguration)?;

    let device_cert = issue_cert(leaf_profile(), &[0], &root_key, &device_key)?;

    Ok(PairCertificates {
        device_cert_pem: cert_pem(&device_cert)?,
        host_cert_pem: identity.host_cert_pem,
        root_cert_pem: identity.root_cert_pem,
    })
}

#[cfg(test)]
mod tests {
    use rsa::pkcs1::EncodeRsaPublicKey;
    use x509_cert::der::DecodePem;

    use super::*;
    use crate::test_util;

    #[test]
    fn device_key_accepted_as_pem_and_der() {
        let pem = test_util::device_public_key_pem();
        let from_pem = parse_device_public_key(pem.as_bytes()).unwrap();

        let der = from_pem.to_pkcs1_der().unwrap();
        let from_der = parse_device_public_key(der.as_bytes()).unwrap();
        assert_eq!(from_pem, from_der);

        assert!(matches!(
            parse_device_public_key(b""),
            Err(LockdownError::InvalidArgument)
        ));
        assert!(matches!(
            parse_device_public_key(b"-----BEGIN RSA PUBLIC KEY-----\ngarbage\n-----END RSA PUBLIC KEY-----\n"),
            Err(LockdownError::Crypto(_))
        ));
    }

    #[test]
    fn device_certificate_shape() {
        let store = test_util::shared_store();
        let pem = test_util::device_public_key_pem();

        let certs = generate_pair_certificates(pem.as_bytes(), store).unwrap();

        let device = Certificate::from_pem(&certs.device_cert_pem).unwrap();
        assert_eq!(device.tbs_certificate.serial_number.as_bytes(), &[0]);

        let not_before = device
            .tbs_certificate
            .validity
            .not_before
            .to_unix_duration();
        let not_after = device.tbs_certificate.validity.not_after.to_unix_duration();
        let lifetime = not_after - not_before;
        assert!(lifetime >= CERT_LIFETIME - Duration::from_secs(86_400));
        assert!(lifetime <= CERT_LIFETIME + Duration::from_secs(86_400));

        // chained to the stored root
        let root = Certificate::from_pem(&certs.root_cert_pem).unwrap();
        assert_eq!(device.tbs_certificate.issuer, root.tbs_certificate.subject);

        // host and root come back exactly as persisted
        let identity = store.identity().unwrap();
        assert_eq!(certs.host_cert_pem, identity.host_cert_pem);
        assert_eq!(certs.root_cert_pem, identity.root_cert_pem);
    }
}
