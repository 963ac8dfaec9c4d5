/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for DNS over TLS
//!
//! Provides pre-built TLS configurations for:
//! - Secure mode: validates certificates against the bundled webpki roots
//! - Insecure mode: skips certificate validation (for testing only)
//!
//! Configurations are lazily initialized and cached for reuse.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Once};

lazy_static::lazy_static! {
    /// Secure TLS configuration with certificate validation
    static ref SECURE_CONFIG: ClientConfig = build_secure_config();

    /// Insecure TLS configuration (no certificate validation)
    static ref INSECURE_CONFIG: ClientConfig = build_insecure_config();
}

static DEFAULT_PROVIDER: Once = Once::new();

/// Install ring as the process-wide rustls provider, once
///
/// Another component may already have installed a provider; that is fine,
/// every config here is built with an explicit provider anyway.
pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        let _ = ring::default_provider().install_default();
    })
}

fn build_secure_config() -> ClientConfig {
    install_default_provider();
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map(|builder| {
            builder
                .with_root_certificates(root_store.clone())
                .with_no_client_auth()
        })
        // ring always supports the safe defaults; fall back to the global builder just in case
        .unwrap_or_else(|_| {
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        })
}

/// **WARNING**: Skips all certificate validation. Use only for testing!
fn build_insecure_config() -> ClientConfig {
    install_default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth()
}

/// Get secure TLS configuration (with certificate validation)
pub(crate) fn secure_client_config() -> ClientConfig {
    SECURE_CONFIG.clone()
}

/// Get insecure TLS configuration (no certificate validation)
///
/// **WARNING**: Only use for testing/development!
pub(crate) fn insecure_client_config() -> ClientConfig {
    INSECURE_CONFIG.clone()
}

/// Certificate verifier that accepts any certificate (INSECURE!)
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
