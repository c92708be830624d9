//! TLS configuration and certificate loading for peer connections.
//!
//! # Responsibilities
//! - Build the client `TlsConnector` from `[peers.tls]`
//! - Load CA bundles, CA directories, client certificates and keys
//! - Decrypt passphrase-protected PKCS#8 keys
//!
//! # Design Decisions
//! - Without any CA or certificate configured the channel is encrypted but
//!   the peer is not authenticated; handshake signatures are still checked
//! - As soon as any material is configured, verification against the
//!   configured roots is mandatory

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio_rustls::TlsConnector;

use crate::config::TlsSettings;

/// Errors raised while preparing TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("cannot decrypt private key {path}: {reason}")]
    Decrypt { path: PathBuf, reason: String },

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build the connector used for every peer session.
///
/// Returns `None` when TLS is disabled.
pub fn build_connector(settings: &TlsSettings) -> Result<Option<TlsConnector>, TlsError> {
    if settings.disable {
        tracing::warn!("TLS disabled, peer traffic is sent in plaintext");
        return Ok(None);
    }

    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = if settings.has_material() {
        let roots = load_roots(settings)?;
        tracing::info!(roots = roots.len(), "Peer certificate verification enabled");
        builder.with_root_certificates(roots)
    } else {
        tracing::info!("No CA configured, peers are not authenticated");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoPeerVerification { provider }))
    };

    let config = match (&settings.certificate, &settings.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path, settings.passphrase.as_deref())?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Some(TlsConnector::from(Arc::new(config))))
}

fn load_roots(settings: &TlsSettings) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    if let Some(ca_file) = &settings.ca_file {
        for cert in load_certs(ca_file)? {
            roots.add(cert)?;
        }
    }

    if let Some(ca_path) = &settings.ca_path {
        let entries = fs::read_dir(ca_path).map_err(|source| TlsError::Read {
            path: ca_path.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // Directories often mix PEM files with hash links and notes.
            match load_certs(&path) {
                Ok(certs) => {
                    for cert in certs {
                        if let Err(e) = roots.add(cert) {
                            tracing::debug!(path = %path.display(), error = %e, "Skipping CA certificate");
                        }
                    }
                }
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "Skipping CA file"),
            }
        }
    }

    if roots.is_empty() {
        let path = settings
            .ca_file
            .clone()
            .or_else(|| settings.ca_path.clone())
            .unwrap_or_default();
        return Err(TlsError::NoCertificates(path));
    }
    Ok(roots)
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load a private key, decrypting it with `passphrase` when given.
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, TlsError> {
    let read_err = |source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    };

    if let Some(passphrase) = passphrase {
        let pem = fs::read_to_string(path).map_err(read_err)?;
        return decrypt_pkcs8(&pem, passphrase).map_err(|reason| TlsError::Decrypt {
            path: path.to_path_buf(),
            reason,
        });
    }

    let file = fs::File::open(path).map_err(read_err)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(read_err)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn decrypt_pkcs8(pem: &str, passphrase: &str) -> Result<PrivateKeyDer<'static>, String> {
    let (label, document) = pkcs8::SecretDocument::from_pem(pem).map_err(|e| e.to_string())?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Err(format!("expected an ENCRYPTED PRIVATE KEY block, found {}", label));
    }

    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| e.to_string())?;
    let decrypted = encrypted.decrypt(passphrase).map_err(|e| e.to_string())?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(decrypted.as_bytes().to_vec())))
}

/// Accepts any peer certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoPeerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoPeerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs8::LineEnding;
    use pkcs8::pkcs5::pbes2;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn disabled_tls_has_no_connector() {
        let settings = TlsSettings {
            disable: true,
            ..TlsSettings::default()
        };
        assert!(build_connector(&settings).unwrap().is_none());
    }

    #[test]
    fn no_material_builds_unverified_connector() {
        assert!(build_connector(&TlsSettings::default()).unwrap().is_some());
    }

    #[test]
    fn ca_file_and_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let ca = rcgen::generate_simple_self_signed(vec!["monitor".into()]).unwrap();
        let client = rcgen::generate_simple_self_signed(vec!["agent".into()]).unwrap();

        let settings = TlsSettings {
            ca_file: Some(write(dir.path(), "ca.pem", &ca.cert.pem())),
            certificate: Some(write(dir.path(), "client.pem", &client.cert.pem())),
            key_file: Some(write(dir.path(), "client.key", &client.key_pair.serialize_pem())),
            ..TlsSettings::default()
        };
        assert!(build_connector(&settings).unwrap().is_some());
    }

    #[test]
    fn ca_directory_skips_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = rcgen::generate_simple_self_signed(vec!["monitor".into()]).unwrap();
        write(dir.path(), "ca.pem", &ca.cert.pem());
        write(dir.path(), "README", "not a certificate");

        let settings = TlsSettings {
            ca_path: Some(dir.path().to_path_buf()),
            ..TlsSettings::default()
        };
        assert_eq!(load_roots(&settings).unwrap().len(), 1);
    }

    #[test]
    fn empty_ca_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TlsSettings {
            ca_file: Some(write(dir.path(), "ca.pem", "")),
            ..TlsSettings::default()
        };
        assert!(matches!(build_connector(&settings), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn encrypted_key_needs_the_right_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let der = key.serialize_der();
        let info = pkcs8::PrivateKeyInfo::try_from(der.as_slice()).unwrap();

        let salt = [7u8; 16];
        let iv = [9u8; 16];
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(2048, &salt, &iv).unwrap();
        let encrypted = info.encrypt_with_params(params, "hunter2").unwrap();
        let pem = encrypted.to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF).unwrap();
        let path = write(dir.path(), "client.key", &pem);

        let decrypted = load_private_key(&path, Some("hunter2")).unwrap();
        assert_eq!(decrypted.secret_der(), der.as_slice());

        assert!(matches!(
            load_private_key(&path, Some("wrong")),
            Err(TlsError::Decrypt { .. })
        ));
    }
}
