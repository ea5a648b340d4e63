//! TLS configuration for both ends of the control connection.
//!
//! The server loads an X.509 pair from disk, generating a self-signed one on
//! first run. The client validates against the bundled web roots unless it
//! was created with `trust_self_signed`, in which case certificate checks are
//! skipped (the usual mode for a friend-group server with a generated cert).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::info;

/// Install the process-wide crypto provider. Safe to call more than once.
pub fn init_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn client_config(trust_self_signed: bool) -> rustls::ClientConfig {
    if trust_self_signed {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Turn a host string into a TLS server name, accepting bare IPs.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        Ok(ServerName::IpAddress(ip.into()))
    } else {
        ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid server name '{host}'"))
    }
}

/// Generate a self-signed pair on first run if neither file exists.
pub fn load_or_generate_cert(cert_path: &Path, key_path: &Path) -> Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    info!("no certificate found, generating self-signed pair");
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("certificate generation failed")?;
    std::fs::write(cert_path, generated.cert.pem())
        .with_context(|| format!("writing {}", cert_path.display()))?;
    std::fs::write(key_path, generated.key_pair.serialize_pem())
        .with_context(|| format!("writing {}", key_path.display()))?;
    Ok(())
}

pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("reading certificate {}", cert_path.display()))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("reading key {}", key_path.display()))?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::io::Result<_>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .context("no private key found in key file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    Ok(config)
}

/// Verifier that accepts whatever certificate the server presents.
/// Signatures are still checked so the session itself is sound.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(server_name("192.168.1.10").is_ok());
        assert!(server_name("example.com").is_ok());
        assert!(server_name("bad name with spaces").is_err());
    }

    #[test]
    fn test_generate_and_load_cert() {
        let dir = std::env::temp_dir().join(format!("huddle-tls-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("server.crt");
        let key = dir.join("server.key");

        load_or_generate_cert(&cert, &key).unwrap();
        assert!(cert.exists() && key.exists());
        // Second call must leave the existing pair alone.
        let before = std::fs::read(&cert).unwrap();
        load_or_generate_cert(&cert, &key).unwrap();
        assert_eq!(before, std::fs::read(&cert).unwrap());

        init_crypto();
        server_config(&cert, &key).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
