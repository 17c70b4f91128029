//! Certificate and QUIC config helpers.

use std::sync::{Arc, Once};
use std::time::Duration;

use proto::TransportError;
use quinn::{ClientConfig, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Keep-alive interval for client connections, well under the idle timeout.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the ring crypto provider once per process.
pub fn ensure_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A generated localhost certificate.
pub struct SelfSigned {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
    /// PEM encoding of `cert`, for handing to clients.
    pub cert_pem: String,
}

/// Generates a localhost self-signed certificate and private key pair.
pub fn generate_self_signed() -> Result<SelfSigned, TransportError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(SelfSigned {
        cert: cert_der,
        key: key_der,
        cert_pem: cert.cert.pem(),
    })
}

/// Parses every certificate in a PEM bundle.
pub fn load_certs_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e: std::io::Error| TransportError::Tls(e.to_string()))?;
    if certs.is_empty() {
        return Err(TransportError::Tls("No certificate found".into()));
    }
    Ok(certs)
}

/// Parses the first private key in a PEM bundle.
pub fn load_key_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut std::io::BufReader::new(pem))
        .map_err(|e: std::io::Error| TransportError::Tls(e.to_string()))?
        .ok_or_else(|| TransportError::Tls("No private key found".into()))
}

/// Builds a QUIC server config from DER certificates and private key.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TransportError> {
    ensure_crypto_provider();
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(e.to_string()))?,
    )))
}

/// Builds a QUIC client config trusting only `roots`.
pub fn client_config(roots: Vec<CertificateDer<'static>>) -> Result<ClientConfig, TransportError> {
    ensure_crypto_provider();
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }

    let mut config = ClientConfig::with_root_certificates(Arc::new(store))
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cert_round_trips_through_pem() {
        let generated = generate_self_signed().expect("self-signed cert should be generated");
        let parsed = load_certs_pem(generated.cert_pem.as_bytes()).expect("pem should parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], generated.cert);
    }

    #[test]
    fn server_and_client_configs_build_from_generated_cert() {
        let generated = generate_self_signed().expect("cert");
        server_config(vec![generated.cert.clone()], generated.key).expect("server config");
        client_config(vec![generated.cert]).expect("client config");
    }

    #[test]
    fn invalid_pem_is_rejected() {
        let err = load_certs_pem(b"invalid cert").expect_err("no certs");
        assert!(err.to_string().contains("TLS error"));
        let err = load_key_pem(b"invalid key").expect_err("no key");
        assert!(err.to_string().contains("No private key found"));
    }
}
