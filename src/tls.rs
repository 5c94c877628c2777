//! Child credential and TLS client configuration
//!
//! The child holds a private key only; a self-signed certificate is derived
//! from it at load time and presented to the parent, which pins its
//! fingerprint.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

/// Subject name baked into the derived certificate
const CERT_SUBJECT: &str = "afterglow-child";

/// The child's identity: its private key and a certificate derived from it.
pub struct Credential {
    path: PathBuf,
    key: PrivatePkcs8KeyDer<'static>,
    cert: CertificateDer<'static>,
}

impl Credential {
    /// Load a PEM (PKCS#8) private key and derive a self-signed certificate.
    pub fn load(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::credential(path, e.to_string()))?;
        check_key_permissions(path, &meta)?;

        let file = fs::File::open(path).map_err(|e| Error::credential(path, e.to_string()))?;
        let mut rd = BufReader::new(file);
        let key = match rustls_pemfile::pkcs8_private_keys(&mut rd).next() {
            Some(key) => key.map_err(|e| Error::credential(path, format!("read key: {e}")))?,
            None => {
                return Err(Error::credential(
                    path,
                    "no PKCS#8 private key found (convert with `openssl pkcs8 -topk8 -nocrypt`)",
                ))
            }
        };

        let cert = derive_certificate(path, &key)?;
        Ok(Self {
            path: path.to_path_buf(),
            key,
            cert,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 of the derived certificate, for the parent to pin.
    pub fn fingerprint(&self) -> String {
        fp_sha256_hex(&self.cert)
    }

    /// TLS client config used on accepted sockets: presents the derived
    /// certificate, does not verify the parent's certificate.
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        let verifier = NoHostVerification::new();
        let cfg = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                vec![self.cert.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )?;
        Ok(cfg)
    }
}

#[cfg(unix)]
fn check_key_permissions(path: &Path, meta: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Error::CredentialPermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &Path, _meta: &fs::Metadata) -> Result<()> {
    Ok(())
}

fn derive_certificate(path: &Path, key: &PrivatePkcs8KeyDer<'_>) -> Result<CertificateDer<'static>> {
    let key_pair = rcgen::KeyPair::from_der(key.secret_pkcs8_der())
        .map_err(|e| Error::credential(path, format!("unsupported key: {e}")))?;
    let mut params = rcgen::CertificateParams::new(vec![CERT_SUBJECT.to_string()]);
    params.alg = key_pair.algorithm();
    params.key_pair = Some(key_pair);
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::credential(path, format!("derive certificate: {e}")))?;
    let der = cert
        .serialize_der()
        .map_err(|e| Error::credential(path, format!("serialize certificate: {e}")))?;
    Ok(CertificateDer::from(der))
}

fn fp_sha256_hex(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    let digest = h.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Accepts any parent certificate; the parent authenticates the child,
/// not the other way round. Handshake signatures are still checked.
#[derive(Debug)]
struct NoHostVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoHostVerification {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoHostVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub fn server_name_for(ip: IpAddr) -> ServerName<'static> {
    ServerName::IpAddress(ip.into())
}
