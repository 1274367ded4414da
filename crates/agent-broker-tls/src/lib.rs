use std::sync::Once;

use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;

static INIT: Once = Once::new();

/// rustls 0.23 selects a process-level CryptoProvider.
///
/// reqwest and the pinned config below must agree on it, so we install ring once
/// before any config is built.
pub fn init_rustls_crypto_provider() {
    INIT.call_once(|| {
        // If another provider was already installed, ignore the error.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS client config for talking to the deployment backend.
///
/// With `ca_pem` set, only the certificates in that bundle are trusted (the
/// backend usually presents a self-signed CA). Without it:
/// - Try OS/native roots via `rustls-native-certs`.
/// - If that yields 0 roots, fall back to `webpki-roots` (Mozilla bundle).
pub fn client_config(ca_pem: Option<&[u8]>) -> anyhow::Result<rustls::ClientConfig> {
    init_rustls_crypto_provider();

    let roots = match ca_pem {
        Some(pem) => pinned_roots(pem)?,
        None => system_roots(),
    };

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn pinned_roots(pem: &[u8]) -> anyhow::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(pem) {
        let cert = cert.context("parse pinned CA certificate")?;
        roots.add(cert).context("add pinned CA certificate")?;
    }
    anyhow::ensure!(
        !roots.is_empty(),
        "pinned CA bundle contains no certificates"
    );
    Ok(roots)
}

fn system_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        // Ignore individual bad certs; we only need a working store.
        let _ = roots.add(cert);
    }

    if roots.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}
