//! TLS configuration for the in-session upgrade.
//!
//! The device presents a certificate chained to the root this host minted
//! during pairing, so WebPKI verification has nothing to anchor on; the
//! session is authenticated the other way around, by the client certificate
//! the device demanded at pairing time. The device side of the handshake
//! historically spoke SSL 3.0 with anonymous DH and CBC suites; that floor is
//! not expressible in rustls, and devices accept TLS 1.2/1.3 from current
//! hosts.

use std::sync::Arc;

use rustls::{
    ClientConfig, DigitallySignedStruct,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};

use crate::{LockdownError, prefs::HostIdentity};

/// Accepts whatever certificate the device presents. The chain terminates at
/// our own root and carries no usable names, so every standard check would
/// fail by construction.
#[derive(Debug)]
pub(crate) struct TrustDeviceCert;

impl ServerCertVerifier for TrustDeviceCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        // everything the device family has ever signed with
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Installs a process-wide crypto provider when none is configured yet.
pub(crate) fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // A concurrent installer may win the race; that is fine.
        if let Err(e) = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        ) {
            log::debug!("default crypto provider already installed: {e:?}");
        }
    }
}

/// Builds the client configuration for a session upgrade: client auth with
/// the host certificate, no server verification, no resumption.
pub(crate) fn client_config(identity: &HostIdentity) -> Result<ClientConfig, LockdownError> {
    ensure_crypto_provider();

    let cert = CertificateDer::from_pem_slice(&identity.host_cert_pem)?;
    let key = PrivateKeyDer::from_pem_slice(&identity.host_key_pem)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustDeviceCert))
        .with_client_auth_cert(vec![cert], key)?;

    // sessions are one-shot; the device does not resume
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use super::*;
    use crate::test_util;

    fn server_config(identity: &HostIdentity) -> rustls::ServerConfig {
        ensure_crypto_provider();
        let cert = CertificateDer::from_pem_slice(&identity.host_cert_pem).unwrap();
        let key = PrivateKeyDer::from_pem_slice(&identity.host_key_pem).unwrap();
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_with_self_minted_identity() {
        let identity = test_util::shared_store().identity().unwrap();

        let config = client_config(&identity).unwrap();
        let connector = TlsConnector::from(Arc::new(config));
        let acceptor = TlsAcceptor::from(Arc::new(server_config(&identity)));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
        });

        let name = ServerName::try_from("Device").unwrap();
        let mut stream = connector.connect(name, client_io).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();
    }
}
