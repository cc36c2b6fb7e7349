//! Server-side TLS configuration.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::ServerError;
use crate::config::TlsSettings;

/// Subject alternative names of a generated certificate.
const SELF_SIGNED_NAMES: &[&str] = &["localhost", "127.0.0.1", "blockwire.local"];

/// Builds the acceptor for TLS connections.
///
/// Missing certificate files are generated (self-signed) when the
/// settings allow it, and written to the configured paths so clients can
/// pin the same certificate across restarts.
pub fn build_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, ServerError> {
    if !settings.cert_path.exists() || !settings.key_path.exists() {
        if !settings.self_signed {
            return Err(ServerError::Certificate(format!(
                "certificate {} or key {} not found",
                settings.cert_path.display(),
                settings.key_path.display()
            )));
        }
        generate_self_signed(&settings.cert_path, &settings.key_path)?;
    }

    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;
    let config = server_config(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Assembles a rustls server config on the ring provider.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, ServerError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Writes a fresh self-signed certificate and its PKCS#8 key as PEM.
pub fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), ServerError> {
    let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|s| s.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ServerError::Certificate(format!("generate self-signed: {e}")))?;

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
    }
    fs::write(cert_path, certified.cert.pem())?;
    fs::write(key_path, certified.key_pair.serialize_pem())?;
    restrict_permissions(key_path);

    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok(())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Certificate(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| ServerError::Certificate(format!("no private key in {}", path.display())))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), "failed to restrict key permissions: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
