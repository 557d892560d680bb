//! TLS configuration for connection attempts.
//!
//! This module does not perform handshakes. It describes what a TLS stack has enabled
//! ([`SecureSocket`]), what a connection is allowed to negotiate
//! ([`ConnectionSpec`][spec::ConnectionSpec]) and, via
//! [`ConnectionSpecSelector`][selector::ConnectionSpecSelector], which of an ordered
//! list of specs to try next.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::BoxError;
use crate::DebugLiteral;

#[cfg(feature = "tls")]
pub mod rustls;
pub mod selector;
pub mod spec;

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum TlsVersion {
    /// TLS 1.3, 2016.
    Tls13,
    /// TLS 1.2, 2008.
    Tls12,
    /// TLS 1.1, 2006.
    Tls11,
    /// TLS 1.0, 1999.
    Tls10,
    /// SSL 3.0, 1996.
    Ssl30,
}

impl TlsVersion {
    /// The conventional name of this version, e.g. `TLSv1.2`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls13 => "TLSv1.3",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Ssl30 => "SSLv3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A TLS version name could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unexpected TLS version: {0}")]
pub struct UnknownTlsVersion(String);

impl FromStr for TlsVersion {
    type Err = UnknownTlsVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.1" => Ok(TlsVersion::Tls11),
            "TLSv1" | "TLSv1.0" => Ok(TlsVersion::Tls10),
            "SSLv3" => Ok(TlsVersion::Ssl30),
            _ => Err(UnknownTlsVersion(s.to_owned())),
        }
    }
}

/// A TLS cipher suite, identified by its IANA name.
///
/// Cipher suites are compared by name, so suites from different TLS stacks can be
/// intersected as long as they agree on the IANA naming.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CipherSuite(Cow<'static, str>);

impl CipherSuite {
    /// A cipher suite from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// A cipher suite from an owned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The IANA name of this suite.
    pub fn name(&self) -> &str {
        &self.0
    }
}

// IANA cipher suite names, limited to the suites referenced by the built-in specs.
#[allow(missing_docs)]
impl CipherSuite {
    pub const TLS_AES_128_GCM_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_AES_128_GCM_SHA256");
    pub const TLS_AES_256_GCM_SHA384: CipherSuite =
        CipherSuite::from_static("TLS_AES_256_GCM_SHA384");
    pub const TLS_CHACHA20_POLY1305_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_CHACHA20_POLY1305_SHA256");
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256");
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256");
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384");
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384");
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256");
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256");
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA");
    pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA");
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA");
    pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA");
    pub const TLS_RSA_WITH_AES_128_GCM_SHA256: CipherSuite =
        CipherSuite::from_static("TLS_RSA_WITH_AES_128_GCM_SHA256");
    pub const TLS_RSA_WITH_AES_256_GCM_SHA384: CipherSuite =
        CipherSuite::from_static("TLS_RSA_WITH_AES_256_GCM_SHA384");
    pub const TLS_RSA_WITH_AES_128_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_RSA_WITH_AES_128_CBC_SHA");
    pub const TLS_RSA_WITH_AES_256_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_RSA_WITH_AES_256_CBC_SHA");
    pub const TLS_RSA_WITH_3DES_EDE_CBC_SHA: CipherSuite =
        CipherSuite::from_static("TLS_RSA_WITH_3DES_EDE_CBC_SHA");

    /// Signalling cipher suite value announcing a protocol downgrade (RFC 7507).
    pub const TLS_FALLBACK_SCSV: CipherSuite = CipherSuite::from_static("TLS_FALLBACK_SCSV");
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CipherSuite {
    fn from(value: &'static str) -> Self {
        CipherSuite::from_static(value)
    }
}

/// The TLS capabilities of a socket before its handshake.
///
/// A [`ConnectionSpec`][spec::ConnectionSpec] is compatible with a socket when their
/// enabled cipher suites and TLS versions intersect. Applying a spec narrows the
/// socket's enabled lists to that intersection.
pub trait SecureSocket {
    /// Cipher suites the socket will currently offer.
    fn enabled_cipher_suites(&self) -> &[CipherSuite];

    /// Every cipher suite the socket's TLS stack knows about, including signalling
    /// suites which are never enabled by default.
    fn supported_cipher_suites(&self) -> &[CipherSuite];

    /// TLS versions the socket will currently offer.
    fn enabled_protocols(&self) -> &[TlsVersion];

    /// Restrict the cipher suites the socket will offer.
    fn set_enabled_cipher_suites(&mut self, suites: Vec<CipherSuite>);

    /// Restrict the TLS versions the socket will offer.
    fn set_enabled_protocols(&mut self, versions: Vec<TlsVersion>);
}

/// A snapshot of a TLS stack's capabilities, which can be narrowed by a connection
/// spec and then handed to a [`Connector`][crate::Connector].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSocket {
    enabled_cipher_suites: Vec<CipherSuite>,
    supported_cipher_suites: Vec<CipherSuite>,
    enabled_protocols: Vec<TlsVersion>,
}

impl TlsSocket {
    /// A socket with the given suites and versions enabled.
    ///
    /// The supported suites default to the enabled suites.
    pub fn new(
        enabled_cipher_suites: impl IntoIterator<Item = CipherSuite>,
        enabled_protocols: impl IntoIterator<Item = TlsVersion>,
    ) -> Self {
        let enabled_cipher_suites: Vec<_> = enabled_cipher_suites.into_iter().collect();
        Self {
            supported_cipher_suites: enabled_cipher_suites.clone(),
            enabled_cipher_suites,
            enabled_protocols: enabled_protocols.into_iter().collect(),
        }
    }

    /// Set the suites the TLS stack supports, in addition to the enabled ones.
    pub fn with_supported_cipher_suites(
        mut self,
        supported: impl IntoIterator<Item = CipherSuite>,
    ) -> Self {
        self.supported_cipher_suites = supported.into_iter().collect();
        self
    }
}

impl SecureSocket for TlsSocket {
    fn enabled_cipher_suites(&self) -> &[CipherSuite] {
        &self.enabled_cipher_suites
    }

    fn supported_cipher_suites(&self) -> &[CipherSuite] {
        &self.supported_cipher_suites
    }

    fn enabled_protocols(&self) -> &[TlsVersion] {
        &self.enabled_protocols
    }

    fn set_enabled_cipher_suites(&mut self, suites: Vec<CipherSuite>) {
        self.enabled_cipher_suites = suites;
    }

    fn set_enabled_protocols(&mut self, versions: Vec<TlsVersion>) {
        self.enabled_protocols = versions;
    }
}

/// Produces a fresh [`TlsSocket`] for every TLS connection attempt.
pub trait SecureSocketFactory: fmt::Debug + Send + Sync + 'static {
    /// Create a socket with the TLS stack's default capabilities.
    fn create_socket(&self) -> TlsSocket;
}

impl SecureSocketFactory for TlsSocket {
    fn create_socket(&self) -> TlsSocket {
        self.clone()
    }
}

/// Verifies that a peer's certificate chain is acceptable for a host name.
pub trait HostnameVerifier: fmt::Debug + Send + Sync + 'static {
    /// Returns `true` if `peer_certificates` (DER encoded, leaf first) are valid for `host`.
    fn verify(&self, host: &str, peer_certificates: &[Vec<u8>]) -> bool;
}

/// Accepts whatever the TLS stack's own certificate verification accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostnameVerifier;

impl HostnameVerifier for DefaultHostnameVerifier {
    fn verify(&self, _host: &str, _peer_certificates: &[Vec<u8>]) -> bool {
        true
    }
}

/// Constrains which certificates are trusted for a host beyond the TLS stack's roots.
pub trait CertificatePinner: fmt::Debug + Send + Sync + 'static {
    /// Check the peer's certificate chain (DER encoded, leaf first) for `host`.
    fn check(&self, host: &str, peer_certificates: &[Vec<u8>]) -> Result<(), BoxError>;
}

/// A pinner without pins: every chain is accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPinning;

impl CertificatePinner for NoPinning {
    fn check(&self, _host: &str, _peer_certificates: &[Vec<u8>]) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Pins hosts to exact leaf certificates.
#[derive(Debug, Default, Clone)]
pub struct LeafPinner {
    pins: Vec<(String, Vec<u8>)>,
}

impl LeafPinner {
    /// Create a pinner with no pins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `host` to the DER encoded `certificate`. A host may be pinned to several certificates.
    pub fn pin(mut self, host: impl Into<String>, certificate: impl Into<Vec<u8>>) -> Self {
        self.pins.push((host.into(), certificate.into()));
        self
    }
}

impl CertificatePinner for LeafPinner {
    fn check(&self, host: &str, peer_certificates: &[Vec<u8>]) -> Result<(), BoxError> {
        let mut pins = self
            .pins
            .iter()
            .filter(|(pinned, _)| pinned.eq_ignore_ascii_case(host))
            .peekable();

        if pins.peek().is_none() {
            return Ok(());
        }

        let leaf = peer_certificates.first().ok_or("no peer certificates")?;
        if pins.any(|(_, certificate)| certificate == leaf) {
            Ok(())
        } else {
            Err(format!("certificate pinning failure for {host}").into())
        }
    }
}

/// Everything an address needs to speak TLS.
///
/// Secure addresses carry exactly one policy; cleartext addresses carry none.
#[derive(Clone)]
pub struct TlsPolicy {
    socket_factory: Arc<dyn SecureSocketFactory>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Arc<dyn CertificatePinner>,
}

impl TlsPolicy {
    /// A policy using the default hostname verifier and no certificate pins.
    pub fn new(socket_factory: Arc<dyn SecureSocketFactory>) -> Self {
        static VERIFIER: OnceLock<Arc<dyn HostnameVerifier>> = OnceLock::new();
        static PINNER: OnceLock<Arc<dyn CertificatePinner>> = OnceLock::new();

        Self {
            socket_factory,
            hostname_verifier: VERIFIER
                .get_or_init(|| Arc::new(DefaultHostnameVerifier))
                .clone(),
            certificate_pinner: PINNER.get_or_init(|| Arc::new(NoPinning)).clone(),
        }
    }

    /// Replace the hostname verifier.
    pub fn with_hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = verifier;
        self
    }

    /// Replace the certificate pinner.
    pub fn with_certificate_pinner(mut self, pinner: Arc<dyn CertificatePinner>) -> Self {
        self.certificate_pinner = pinner;
        self
    }

    /// The factory producing TLS sockets.
    pub fn socket_factory(&self) -> &Arc<dyn SecureSocketFactory> {
        &self.socket_factory
    }

    /// The hostname verifier.
    pub fn hostname_verifier(&self) -> &Arc<dyn HostnameVerifier> {
        &self.hostname_verifier
    }

    /// The certificate pinner.
    pub fn certificate_pinner(&self) -> &Arc<dyn CertificatePinner> {
        &self.certificate_pinner
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("socket_factory", &self.socket_factory)
            .field("hostname_verifier", &DebugLiteral("<verifier>"))
            .field("certificate_pinner", &self.certificate_pinner)
            .finish()
    }
}

impl PartialEq for TlsPolicy {
    fn eq(&self, other: &Self) -> bool {
        crate::same_instance(&self.socket_factory, &other.socket_factory)
            && crate::same_instance(&self.hostname_verifier, &other.hostname_verifier)
            && crate::same_instance(&self.certificate_pinner, &other.certificate_pinner)
    }
}

impl Eq for TlsPolicy {}

impl Hash for TlsPolicy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        crate::hash_instance(&self.socket_factory, state);
        crate::hash_instance(&self.hostname_verifier, state);
        crate::hash_instance(&self.certificate_pinner, state);
    }
}

/// The peer presented a certificate which is not valid: expired, untrusted, or
/// issued for another name.
///
/// A handshake failure caused by this error is never retried with a fallback
/// connection spec.
#[derive(Debug, Error)]
#[error("invalid certificate: {message}")]
pub struct InvalidCertificate {
    message: String,
}

impl InvalidCertificate {
    /// Create a new certificate error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
