//! TLS handshakes with [rustls](https://docs.rs/rustls).

use std::io;
use std::sync::Arc;

use ::rustls::client::ClientConfig;
use ::rustls::crypto::CryptoProvider;
use ::rustls::{ProtocolVersion, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use thiserror::Error;

use super::{CipherSuite, SecureSocket, SecureSocketFactory, TlsSocket, TlsVersion};
use crate::connect::ConnectError;

/// No rustls [`CryptoProvider`] is installed or enabled by a crate feature.
#[derive(Debug, Error)]
#[error("no rustls crypto provider is available")]
pub struct NoCryptoProvider;

/// A [`SecureSocketFactory`] describing what a rustls [`CryptoProvider`] supports, and
/// which builds client configurations narrowed to a [`TlsSocket`].
///
/// rustls can't offer `TLS_FALLBACK_SCSV`, so the supported suites of its sockets are
/// exactly the enabled suites.
#[derive(Debug, Clone)]
pub struct RustlsSocketFactory {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
}

impl RustlsSocketFactory {
    /// Create a factory from a crypto provider and trusted roots.
    pub fn new(provider: Arc<CryptoProvider>, roots: impl Into<Arc<RootCertStore>>) -> Self {
        Self {
            provider,
            roots: roots.into(),
        }
    }

    /// Create a factory trusting the platform's native certificates, using the default
    /// crypto provider.
    pub fn with_native_roots() -> Result<Self, NoCryptoProvider> {
        let provider = default_provider().ok_or(NoCryptoProvider)?;

        let certificates = rustls_native_certs::load_native_certs();
        for error in &certificates.errors {
            tracing::warn!(%error, "unable to load native certificates");
        }

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certificates.certs);
        tracing::debug!(added, ignored, "loaded native root certificates");

        Ok(Self::new(provider, roots))
    }

    /// The crypto provider.
    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    /// The trusted roots.
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// Build a client configuration offering only what `socket` has enabled.
    ///
    /// `enable_sni` and `alpn` are only honored by connection specs which support TLS
    /// extensions; the caller passes `false` and an empty list otherwise.
    pub fn client_config(
        &self,
        socket: &TlsSocket,
        enable_sni: bool,
        alpn: Vec<Vec<u8>>,
    ) -> Result<ClientConfig, ConnectError> {
        let enabled = socket.enabled_cipher_suites();
        let cipher_suites: Vec<SupportedCipherSuite> = self
            .provider
            .cipher_suites
            .iter()
            .filter(|suite| enabled.contains(&suite_name(suite)))
            .copied()
            .collect();

        let versions: Vec<&'static SupportedProtocolVersion> = ::rustls::ALL_VERSIONS
            .iter()
            .filter(|version| {
                tls_version(version.version)
                    .is_some_and(|version| socket.enabled_protocols().contains(&version))
            })
            .copied()
            .collect();

        if cipher_suites.is_empty() || versions.is_empty() {
            return Err(ConnectError::TlsProtocol(
                format!(
                    "no usable TLS configuration: suites={:?} versions={:?}",
                    socket.enabled_cipher_suites(),
                    socket.enabled_protocols()
                )
                .into(),
            ));
        }

        let provider = CryptoProvider {
            cipher_suites,
            ..CryptoProvider::clone(&self.provider)
        };

        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();

        config.enable_sni = enable_sni;
        config.alpn_protocols = alpn;
        Ok(config)
    }
}

impl SecureSocketFactory for RustlsSocketFactory {
    fn create_socket(&self) -> TlsSocket {
        let suites: Vec<CipherSuite> = self.provider.cipher_suites.iter().map(suite_name).collect();

        let mut versions: Vec<TlsVersion> = self
            .provider
            .cipher_suites
            .iter()
            .filter_map(|suite| tls_version(suite.version().version))
            .collect();
        versions.sort();
        versions.dedup();

        TlsSocket::new(suites, versions)
    }
}

/// The default crypto provider: the process default if one is installed, otherwise the
/// provider selected by crate features.
fn default_provider() -> Option<Arc<CryptoProvider>> {
    if let Some(provider) = CryptoProvider::get_default() {
        return Some(provider.clone());
    }

    #[cfg(feature = "tls-ring")]
    {
        Some(Arc::new(::rustls::crypto::ring::default_provider()))
    }

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    {
        Some(Arc::new(::rustls::crypto::aws_lc_rs::default_provider()))
    }

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    {
        None
    }
}

// rustls names TLS 1.3 suites `TLS13_*`; the IANA names are `TLS_*`.
fn suite_name(suite: &SupportedCipherSuite) -> CipherSuite {
    let name = format!("{:?}", suite.suite());
    match name.strip_prefix("TLS13_") {
        Some(rest) => CipherSuite::new(format!("TLS_{rest}")),
        None => CipherSuite::new(name),
    }
}

fn tls_version(version: ProtocolVersion) -> Option<TlsVersion> {
    match version {
        ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls11),
        ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls10),
        ProtocolVersion::SSLv3 => Some(TlsVersion::Ssl30),
        _ => None,
    }
}

impl From<::rustls::Error> for ConnectError {
    fn from(error: ::rustls::Error) -> Self {
        use ::rustls::Error as E;

        match error {
            E::InvalidCertificate(_)
            | E::NoCertificatesPresented
            | E::PeerIncompatible(_)
            | E::PeerMisbehaved(_)
            | E::AlertReceived(_)
            | E::InappropriateHandshakeMessage { .. }
            | E::HandshakeNotComplete => ConnectError::Handshake(error.into()),
            error => ConnectError::TlsProtocol(error.into()),
        }
    }
}

/// Map an I/O error from a rustls stream, unwrapping the TLS error it may carry.
pub(crate) fn io_error(error: io::Error) -> ConnectError {
    match error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<::rustls::Error>())
    {
        Some(tls) => tls.clone().into(),
        None => ConnectError::Io(error),
    }
}
