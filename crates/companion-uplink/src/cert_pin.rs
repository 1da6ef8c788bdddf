use std::sync::Arc;

use anyhow::Result;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error, SignatureScheme};
use sha2::{Digest, Sha256};

/// Runs normal chain validation, then requires the server key to match a
/// pinned SHA-256 of its SubjectPublicKeyInfo.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned_spki_sha256: [u8; 32],
    inner: Arc<dyn ServerCertVerifier>,
}

impl PinnedCertVerifier {
    pub fn new(pinned_hex: &str, inner: Arc<dyn ServerCertVerifier>) -> Result<Self> {
        Ok(Self { pinned_spki_sha256: parse_pin(pinned_hex)?, inner })
    }
}

pub fn parse_pin(pinned_hex: &str) -> Result<[u8; 32]> {
    let decoded = hex::decode(pinned_hex.trim()).map_err(|e| anyhow::anyhow!("invalid SPKI pin hex: {}", e))?;
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("SPKI pin must be 32 bytes (SHA-256), got {}", v.len()))
}

/// SHA-256 over the DER SubjectPublicKeyInfo of an X.509 certificate.
pub fn spki_sha256(cert_der: &[u8]) -> Option<[u8; 32]> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der).ok()?;
    Some(Sha256::digest(cert.public_key().raw).into())
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let got = spki_sha256(end_entity.as_ref())
            .ok_or_else(|| Error::General("cannot locate SPKI in server certificate".to_string()))?;
        if got != self.pinned_spki_sha256 {
            return Err(Error::General(format!(
                "server SPKI mismatch: expected {}, got {}",
                hex::encode(self.pinned_spki_sha256),
                hex::encode(got)
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
