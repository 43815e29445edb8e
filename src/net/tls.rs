use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::connection::IoStream;
use crate::error::{PoolError, Result};
use crate::models::Certificate;

/// TLS parameters negotiated on top of a TCP connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// SNI name; defaults to the host being dialed
    pub server_name: Option<String>,
    /// Client certificate presented for mutual TLS
    pub client_certificate: Option<Certificate>,
    /// Verify the server chain against the webpki roots
    pub verify: bool,
    pub alpn: Vec<Vec<u8>>,
}

impl TlsOptions {
    pub fn verified(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            verify: true,
            ..Self::default()
        }
    }

    /// Self-signed provider ingress, authenticated by our client certificate.
    pub fn mutual(certificate: Certificate) -> Self {
        Self {
            server_name: None,
            client_certificate: Some(certificate),
            verify: false,
            alpn: Vec::new(),
        }
    }

    pub fn with_alpn(mut self, protocols: &[&[u8]]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = if self.verify {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        };

        let mut config = match &self.client_certificate {
            Some(certificate) => {
                let (chain, key) = parse_certificate(certificate)?;
                builder.with_client_auth_cert(chain, key)?
            }
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn.clone();
        Ok(config)
    }

    /// Run the client handshake over an established stream.
    pub async fn handshake<S>(&self, stream: S, default_host: &str) -> Result<TlsStream<S>>
    where
        S: IoStream,
    {
        let connector = TlsConnector::from(Arc::new(self.client_config()?));
        let name = self.server_name.as_deref().unwrap_or(default_host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| PoolError::Tls(format!("invalid server name '{}': {}", name, e)))?;

        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| PoolError::Tls(format!("handshake with {} failed: {}", name, e)))
    }
}

/// Parse a PEM certificate chain and PKCS#8 key.
pub fn parse_certificate(
    certificate: &Certificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = rustls_pemfile::certs(&mut certificate.cert.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PoolError::Validation(format!("invalid certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(PoolError::Validation(
            "certificate PEM contains no certificate".to_string(),
        ));
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut certificate.key.as_bytes())
        .next()
        .ok_or_else(|| PoolError::Validation("certificate key PEM contains no key".to_string()))?
        .map_err(|e| PoolError::Validation(format!("invalid key PEM: {}", e)))?;

    Ok((chain, PrivateKeyDer::Pkcs8(key)))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verified_config_builds() {
        let options = TlsOptions::verified("example.com").with_alpn(&[b"http/1.1"]);
        let config = options.client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_insecure_config_builds() {
        let options = TlsOptions::default();
        assert!(options.client_config().is_ok());
    }

    #[test]
    fn test_rejects_invalid_client_certificate() {
        let options = TlsOptions::mutual(Certificate {
            cert: "not a pem".to_string(),
            key: "not a key".to_string(),
        });
        let err = options.client_config().unwrap_err();
        assert!(matches!(err, PoolError::Validation(_)));
    }
}
