//! TLS client configuration built from the [`ConfigFile`].
//!
//! The client certificate is re-read from disk on every handshake so rotated certificates are
//! picked up without reconnecting the agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::ResolvesClientCert;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::warn;

use crate::config::ConfigFile;
use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

/// Client certificate read from disk at every handshake. Falls back to the last certificate that
/// loaded successfully when the files are mid-rotation.
#[derive(Debug)]
struct ReloadingClientCert {
    cert_file: PathBuf,
    key_file: PathBuf,
    provider: Arc<CryptoProvider>,
    last_loaded: Mutex<Arc<CertifiedKey>>,
}

impl ReloadingClientCert {
    fn new(cert_file: PathBuf, key_file: PathBuf, provider: Arc<CryptoProvider>) -> Result<Self> {
        let loaded = load_certified_key(&cert_file, &key_file, &provider)?;
        Ok(Self {
            cert_file,
            key_file,
            provider,
            last_loaded: Mutex::new(Arc::new(loaded)),
        })
    }
}

impl ResolvesClientCert for ReloadingClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let mut last_loaded = self.last_loaded.lock();
        match load_certified_key(&self.cert_file, &self.key_file, &self.provider) {
            Ok(loaded) => *last_loaded = Arc::new(loaded),
            Err(err) => warn!(
                %err,
                cert_file = %self.cert_file.display(),
                "Unable to reload client certificate, using the previous one"
            ),
        }
        Some(Arc::clone(&last_loaded))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

fn load_certified_key(
    cert_file: &Path,
    key_file: &Path,
    provider: &CryptoProvider,
) -> Result<CertifiedKey> {
    let certs = load_certs(cert_file)?;
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| {
        Error::Tls(format!(
            "Parsing client private key {}: {e:?}",
            key_file.display()
        ))
    })?;
    let key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| Error::Tls(format!("Client private key is invalid: {e}")))?;
    Ok(CertifiedKey::new(certs, key))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| Error::Tls(format!("Parsing certificates {}: {e:?}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_root_store(trusted_ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match trusted_ca_file {
        Some(ca_file) => {
            for cert in load_certs(ca_file)? {
                root_store.add(cert).map_err(|e| {
                    Error::Tls(format!("Adding CA cert to in-memory cert store: {e:?}"))
                })?;
            }
        }
        None => {
            let native_certs = rustls_native_certs::load_native_certs();
            if !native_certs.errors.is_empty() {
                warn!(errors = ?native_certs.errors, "Some system root certificates could not be loaded");
            }
            root_store.add_parsable_certificates(native_certs.certs);
        }
    }
    Ok(root_store)
}

/// TLS settings for the store transport, `None` when the configuration does not ask for TLS.
pub fn client_config(file: &ConfigFile) -> Result<Option<Arc<ClientConfig>>> {
    if !file.uses_tls() {
        return Ok(None);
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Selecting TLS protocol versions: {e}")))?;

    let builder = if file.insecure_skip_tls_verify {
        warn!(
            "'insecure-skip-tls-verify' is set, certificate validation will not be performed when connecting to the kvstore"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        builder.with_root_certificates(load_root_store(file.trusted_ca_file.as_deref())?)
    };

    let config = match (&file.cert_file, &file.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let resolver =
                ReloadingClientCert::new(cert_file.clone(), key_file.clone(), provider)?;
            builder.with_client_cert_resolver(Arc::new(resolver))
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Tls(
                "cert-file and key-file must be set together".to_string(),
            ));
        }
    };
    Ok(Some(Arc::new(config)))
}
