//! Connection specs: one tier of acceptable TLS versions and cipher suites.

use std::borrow::Cow;
use std::fmt;

use super::{CipherSuite, SecureSocket, TlsVersion};
use crate::Error;

// Roughly the suites offered by current browsers, strongest first. The CBC and
// plain RSA suites at the end are on HTTP/2's blocklist, but are kept so that
// older servers remain reachable.
const APPROVED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS_AES_128_GCM_SHA256,
    CipherSuite::TLS_AES_256_GCM_SHA384,
    CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
    CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
    CipherSuite::TLS_RSA_WITH_AES_256_CBC_SHA,
    CipherSuite::TLS_RSA_WITH_3DES_EDE_CBC_SHA,
];

/// Acceptable TLS versions and cipher suites for one connection attempt.
///
/// For TLS connections a spec lists the cipher suites and TLS versions it will accept;
/// `None` for either list means "whatever the socket has enabled". Cleartext specs
/// carry neither.
///
/// Clients usually configure several specs in decreasing order of preference (for
/// example [`MODERN_TLS`][Self::MODERN_TLS] then [`CLEARTEXT`][Self::CLEARTEXT]), and a
/// [`ConnectionSpecSelector`][super::selector::ConnectionSpecSelector] walks them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionSpec {
    tls: bool,
    supports_tls_extensions: bool,
    cipher_suites: Option<Cow<'static, [CipherSuite]>>,
    tls_versions: Option<Cow<'static, [TlsVersion]>>,
}

impl ConnectionSpec {
    /// A modern TLS connection with extensions like SNI and ALPN available.
    pub const MODERN_TLS: ConnectionSpec = ConnectionSpec {
        tls: true,
        supports_tls_extensions: true,
        cipher_suites: Some(Cow::Borrowed(APPROVED_CIPHER_SUITES)),
        tls_versions: Some(Cow::Borrowed(&[
            TlsVersion::Tls13,
            TlsVersion::Tls12,
            TlsVersion::Tls11,
            TlsVersion::Tls10,
        ])),
    };

    /// A backwards-compatible fallback for interoperating with obsolete servers.
    pub const COMPATIBLE_TLS: ConnectionSpec = ConnectionSpec {
        tls: true,
        supports_tls_extensions: true,
        cipher_suites: Some(Cow::Borrowed(APPROVED_CIPHER_SUITES)),
        tls_versions: Some(Cow::Borrowed(&[TlsVersion::Tls10])),
    };

    /// Unencrypted, unauthenticated connections for `http:` URLs.
    pub const CLEARTEXT: ConnectionSpec = ConnectionSpec {
        tls: false,
        supports_tls_extensions: false,
        cipher_suites: None,
        tls_versions: None,
    };

    /// Start building a TLS (`tls = true`) or cleartext spec.
    pub fn builder(tls: bool) -> Builder {
        Builder {
            tls,
            supports_tls_extensions: false,
            cipher_suites: None,
            tls_versions: None,
            error: None,
        }
    }

    /// Start building a spec from a copy of this one.
    pub fn to_builder(&self) -> Builder {
        Builder {
            tls: self.tls,
            supports_tls_extensions: self.supports_tls_extensions,
            cipher_suites: self.cipher_suites.as_ref().map(|s| s.to_vec()),
            tls_versions: self.tls_versions.as_ref().map(|v| v.to_vec()),
            error: None,
        }
    }

    /// Is this a TLS spec?
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Should SNI and ALPN be configured when using this spec?
    pub fn supports_tls_extensions(&self) -> bool {
        self.supports_tls_extensions
    }

    /// Cipher suites to offer, or `None` to offer all of the socket's enabled suites.
    pub fn cipher_suites(&self) -> Option<&[CipherSuite]> {
        self.cipher_suites.as_deref()
    }

    /// TLS versions to offer, or `None` to offer all of the socket's enabled versions.
    pub fn tls_versions(&self) -> Option<&[TlsVersion]> {
        self.tls_versions.as_deref()
    }

    /// Returns `true` if a socket with its current configuration supports this spec.
    ///
    /// Cleartext specs are never compatible with a secure socket. For TLS specs, at least
    /// one of the required versions must be enabled on the socket, and at least one of
    /// the required cipher suites must be enabled on the socket.
    pub fn is_compatible<S: SecureSocket + ?Sized>(&self, socket: &S) -> bool {
        if !self.tls {
            return false;
        }

        if let Some(versions) = self.tls_versions() {
            if !intersects(versions, socket.enabled_protocols()) {
                return false;
            }
        }

        if let Some(suites) = self.cipher_suites() {
            if !intersects(suites, socket.enabled_cipher_suites()) {
                return false;
            }
        }

        true
    }

    /// Narrow the socket's enabled suites and versions to this spec.
    ///
    /// The socket's own ordering is preserved. When `is_fallback` is set and the socket
    /// supports it, [`TLS_FALLBACK_SCSV`][CipherSuite::TLS_FALLBACK_SCSV] is appended so
    /// a server which supports a better version than the one offered can reject the
    /// downgrade.
    pub fn apply<S: SecureSocket + ?Sized>(&self, socket: &mut S, is_fallback: bool) {
        let mut suites: Vec<CipherSuite> = match self.cipher_suites() {
            Some(required) => intersect(socket.enabled_cipher_suites(), required),
            None => socket.enabled_cipher_suites().to_vec(),
        };

        let versions: Vec<TlsVersion> = match self.tls_versions() {
            Some(required) => intersect(socket.enabled_protocols(), required),
            None => socket.enabled_protocols().to_vec(),
        };

        if is_fallback
            && socket
                .supported_cipher_suites()
                .contains(&CipherSuite::TLS_FALLBACK_SCSV)
        {
            suites.push(CipherSuite::TLS_FALLBACK_SCSV);
        }

        socket.set_enabled_protocols(versions);
        socket.set_enabled_cipher_suites(suites);
    }
}

fn intersects<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.iter().any(|item| b.contains(item))
}

/// Items of `a` also present in `b`, in `a`'s order.
fn intersect<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter().filter(|item| b.contains(item)).cloned().collect()
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tls {
            return f.write_str("ConnectionSpec()");
        }

        let mut dbg = f.debug_struct("ConnectionSpec");
        match self.cipher_suites() {
            Some(suites) => dbg.field("cipher_suites", &suites),
            None => dbg.field("cipher_suites", &crate::DebugLiteral("[all enabled]")),
        };
        match self.tls_versions() {
            Some(versions) => dbg.field("tls_versions", &versions),
            None => dbg.field("tls_versions", &crate::DebugLiteral("[all enabled]")),
        };
        dbg.field("supports_tls_extensions", &self.supports_tls_extensions)
            .finish()
    }
}

/// Builder for [`ConnectionSpec`].
#[derive(Debug, Clone)]
pub struct Builder {
    tls: bool,
    supports_tls_extensions: bool,
    cipher_suites: Option<Vec<CipherSuite>>,
    tls_versions: Option<Vec<TlsVersion>>,
    error: Option<String>,
}

impl Builder {
    fn require_tls(&mut self, what: &str) -> bool {
        if !self.tls && self.error.is_none() {
            self.error = Some(format!("no {what} for cleartext connections"));
        }
        self.tls
    }

    /// Offer every cipher suite the socket has enabled.
    pub fn all_enabled_cipher_suites(mut self) -> Self {
        if self.require_tls("cipher suites") {
            self.cipher_suites = None;
        }
        self
    }

    /// Offer only these cipher suites (at least one is required).
    pub fn cipher_suites<I>(mut self, suites: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<CipherSuite>,
    {
        if self.require_tls("cipher suites") {
            self.cipher_suites = Some(suites.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Offer every TLS version the socket has enabled.
    pub fn all_enabled_tls_versions(mut self) -> Self {
        if self.require_tls("TLS versions") {
            self.tls_versions = None;
        }
        self
    }

    /// Offer only these TLS versions (at least one is required).
    pub fn tls_versions(mut self, versions: impl IntoIterator<Item = TlsVersion>) -> Self {
        if self.require_tls("TLS versions") {
            self.tls_versions = Some(versions.into_iter().collect());
        }
        self
    }

    /// Enable SNI and ALPN for connections made with this spec.
    pub fn supports_tls_extensions(mut self, supported: bool) -> Self {
        if self.require_tls("TLS extensions") {
            self.supports_tls_extensions = supported;
        }
        self
    }

    /// Build the spec.
    pub fn build(self) -> Result<ConnectionSpec, Error> {
        if let Some(error) = self.error {
            return Err(Error::InvalidArgument(error));
        }

        if self.cipher_suites.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::InvalidArgument(
                "at least one cipher suite is required".into(),
            ));
        }

        if self.tls_versions.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::InvalidArgument(
                "at least one TLS version is required".into(),
            ));
        }

        Ok(ConnectionSpec {
            tls: self.tls,
            supports_tls_extensions: self.supports_tls_extensions,
            cipher_suites: self.cipher_suites.map(Cow::Owned),
            tls_versions: self.tls_versions.map(Cow::Owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsSocket;

    fn socket(suites: &[CipherSuite], versions: &[TlsVersion]) -> TlsSocket {
        TlsSocket::new(suites.iter().cloned(), versions.iter().copied())
    }

    #[test]
    fn cleartext_is_never_compatible() {
        let socket = socket(
            &[CipherSuite::TLS_AES_128_GCM_SHA256],
            &[TlsVersion::Tls13],
        );
        assert!(!ConnectionSpec::CLEARTEXT.is_compatible(&socket));
        assert!(ConnectionSpec::MODERN_TLS.is_compatible(&socket));
    }

    #[test]
    fn compatibility_requires_both_axes() {
        let legacy = socket(
            &[CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA],
            &[TlsVersion::Tls10],
        );
        assert!(ConnectionSpec::MODERN_TLS.is_compatible(&legacy));
        assert!(ConnectionSpec::COMPATIBLE_TLS.is_compatible(&legacy));

        let tls12_only = socket(
            &[CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            &[TlsVersion::Tls12],
        );
        assert!(!ConnectionSpec::COMPATIBLE_TLS.is_compatible(&tls12_only));

        let unknown_suites = socket(&[CipherSuite::new("TLS_MADE_UP")], &[TlsVersion::Tls12]);
        assert!(!ConnectionSpec::MODERN_TLS.is_compatible(&unknown_suites));
    }

    #[test]
    fn all_enabled_is_compatible_with_anything_tls() {
        let spec = ConnectionSpec::builder(true)
            .all_enabled_cipher_suites()
            .all_enabled_tls_versions()
            .build()
            .unwrap();

        let socket = socket(&[CipherSuite::new("TLS_MADE_UP")], &[TlsVersion::Ssl30]);
        assert!(spec.is_compatible(&socket));
    }

    #[test]
    fn apply_intersects_in_socket_order() {
        let mut socket = socket(
            &[
                CipherSuite::new("TLS_MADE_UP"),
                CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
                CipherSuite::TLS_AES_128_GCM_SHA256,
            ],
            &[TlsVersion::Tls10, TlsVersion::Tls13],
        );

        ConnectionSpec::COMPATIBLE_TLS.apply(&mut socket, false);
        assert_eq!(
            socket.enabled_cipher_suites(),
            &[
                CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
                CipherSuite::TLS_AES_128_GCM_SHA256
            ]
        );
        assert_eq!(socket.enabled_protocols(), &[TlsVersion::Tls10]);
    }

    #[test]
    fn apply_fallback_adds_scsv_when_supported() {
        let base = socket(&[CipherSuite::TLS_AES_128_GCM_SHA256], &[TlsVersion::Tls13]);

        let mut without = base.clone();
        ConnectionSpec::MODERN_TLS.apply(&mut without, true);
        assert!(!without
            .enabled_cipher_suites()
            .contains(&CipherSuite::TLS_FALLBACK_SCSV));

        let mut with = base.with_supported_cipher_suites([
            CipherSuite::TLS_AES_128_GCM_SHA256,
            CipherSuite::TLS_FALLBACK_SCSV,
        ]);
        let mut first = with.clone();
        ConnectionSpec::MODERN_TLS.apply(&mut first, false);
        assert!(!first
            .enabled_cipher_suites()
            .contains(&CipherSuite::TLS_FALLBACK_SCSV));

        ConnectionSpec::MODERN_TLS.apply(&mut with, true);
        assert_eq!(
            with.enabled_cipher_suites().last(),
            Some(&CipherSuite::TLS_FALLBACK_SCSV)
        );
    }

    #[test]
    fn builder_rejects_cleartext_tls_settings() {
        let err = ConnectionSpec::builder(false)
            .cipher_suites([CipherSuite::TLS_AES_128_GCM_SHA256])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = ConnectionSpec::builder(false)
            .supports_tls_extensions(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert_eq!(
            ConnectionSpec::builder(false).build().unwrap(),
            ConnectionSpec::CLEARTEXT
        );
    }

    #[test]
    fn builder_rejects_empty_lists() {
        let err = ConnectionSpec::builder(true)
            .cipher_suites(Vec::<CipherSuite>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = ConnectionSpec::builder(true)
            .tls_versions([])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn to_builder_round_trips_equality() {
        let rebuilt = ConnectionSpec::MODERN_TLS.to_builder().build().unwrap();
        assert_eq!(rebuilt, ConnectionSpec::MODERN_TLS);

        let narrowed = ConnectionSpec::MODERN_TLS
            .to_builder()
            .tls_versions([TlsVersion::Tls12])
            .build()
            .unwrap();
        assert_ne!(narrowed, ConnectionSpec::MODERN_TLS);
        assert_eq!(narrowed.tls_versions(), Some(&[TlsVersion::Tls12][..]));
    }

    #[test]
    fn debug_format() {
        assert_eq!(
            format!("{:?}", ConnectionSpec::CLEARTEXT),
            "ConnectionSpec()"
        );
        let spec = ConnectionSpec::builder(true)
            .all_enabled_cipher_suites()
            .tls_versions([TlsVersion::Tls12])
            .build()
            .unwrap();
        assert_eq!(
            format!("{spec:?}"),
            "ConnectionSpec { cipher_suites: [all enabled], tls_versions: [Tls12], supports_tls_extensions: false }"
        );
    }
}
