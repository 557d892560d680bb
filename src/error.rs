use std::io;

use thiserror::Error;

use crate::connect::RouteError;
use crate::tls::TlsVersion;

/// Errors surfaced by address construction, route selection, TLS configuration
/// selection and the dispatcher.
///
/// Failures of individual connection attempts are not reported through this type
/// directly. They are [`ConnectError`][crate::ConnectError]s, folded into the
/// TLS fallback decision and, once every route has been tried, collected into
/// [`Error::Route`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An address was constructed without a required capability or with
    /// inconsistent fields.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A route was constructed with fields that can't be used together.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// A configuration argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A proxy can't be used to build a route.
    #[error("invalid proxy configuration: {0}")]
    InvalidProxyConfiguration(String),

    /// The resolver failed to look up a host.
    #[error("unable to resolve host {host}")]
    UnknownHost {
        /// The host that was looked up.
        host: String,

        /// The resolver's error.
        #[source]
        source: io::Error,
    },

    /// A proxy produced no candidate endpoints.
    #[error("no route to {host}; {reason}")]
    NoRouteToHost {
        /// The host (or proxy host) without a route.
        host: String,

        /// What ran out.
        reason: String,
    },

    /// Every proxy, endpoint and postponed route has been handed out.
    #[error("no more routes to {host}")]
    RouteExhausted {
        /// The origin host.
        host: String,
    },

    /// None of the remaining connection specs is compatible with the socket.
    #[error(
        "unable to find acceptable protocols. is_fallback={is_fallback}, specs={specs}, enabled protocols={enabled_protocols:?}"
    )]
    NoCompatibleTlsConfig {
        /// Whether a previous attempt with this selector failed.
        is_fallback: bool,

        /// The configured connection specs, formatted for display.
        specs: String,

        /// TLS versions the socket had enabled.
        enabled_protocols: Vec<TlsVersion>,
    },

    /// The address is not secure, but cleartext is not among its connection specs.
    #[error("cleartext communication to {host} not permitted by connection specs")]
    CleartextNotPermitted {
        /// The origin host.
        host: String,
    },

    /// The call was cancelled.
    #[error("canceled")]
    Canceled,

    /// Every route was tried and failed.
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl Error {
    /// Is this a terminal route failure, which a fresh selector might get past later?
    pub fn is_route_failure(&self) -> bool {
        matches!(
            self,
            Error::Route(_) | Error::RouteExhausted { .. } | Error::NoRouteToHost { .. }
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync);

    #[test]
    fn display() {
        let error = Error::NoRouteToHost {
            host: "example.com".into(),
            reason: "exhausted inet socket addresses".into(),
        };
        assert_eq!(
            error.to_string(),
            "no route to example.com; exhausted inet socket addresses"
        );

        let error = Error::UnknownHost {
            host: "nowhere.invalid".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        };
        assert_eq!(error.to_string(), "unable to resolve host nowhere.invalid");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn route_failures() {
        assert!(Error::RouteExhausted {
            host: "example.com".into()
        }
        .is_route_failure());
        assert!(!Error::Canceled.is_route_failure());
    }
}
