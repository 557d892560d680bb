use std::fmt;
use std::io;

use thiserror::Error;

use crate::BoxError;

/// A single connection attempt failed.
///
/// The variant decides whether a TLS fallback attempt is worthwhile: only
/// [`Handshake`][ConnectError::Handshake] failures without a certificate problem, and
/// [`TlsProtocol`][ConnectError::TlsProtocol] failures, are retried with the next
/// connection spec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// Socket level failure, including refused connections and timeouts.
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    /// The peer (or a proxy) violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The TLS handshake failed.
    #[error("TLS handshake failed")]
    Handshake(#[source] BoxError),

    /// A TLS record or negotiation error outside the handshake.
    #[error("TLS protocol error")]
    TlsProtocol(#[source] BoxError),

    /// The peer's identity could not be verified, for example because of a
    /// certificate pinning failure.
    #[error("peer not verified")]
    PeerUnverified(#[source] BoxError),

    /// The call was cancelled while connecting.
    #[error("connection canceled")]
    Canceled,
}

impl ConnectError {
    /// Returns `true` if the failure was caused by an invalid certificate, anywhere
    /// in the chain of sources.
    pub fn is_certificate_failure(&self) -> bool {
        let mut source: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);

        while let Some(error) = source {
            if is_certificate_error(error) {
                return true;
            }

            // io::Error hides its payload from the source chain.
            if let Some(inner) = error
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
            {
                if is_certificate_error(inner) {
                    return true;
                }
            }

            source = error.source();
        }

        false
    }

    /// Returns `true` if the attempt timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Io(error) if error.kind() == io::ErrorKind::TimedOut)
    }
}

fn is_certificate_error(error: &(dyn std::error::Error + 'static)) -> bool {
    if error.is::<crate::tls::InvalidCertificate>() {
        return true;
    }

    #[cfg(feature = "tls")]
    if matches!(
        error.downcast_ref::<rustls::Error>(),
        Some(rustls::Error::InvalidCertificate(_))
    ) {
        return true;
    }

    false
}

/// Every connection attempt for a call failed.
///
/// Attempts are recorded in the order they were made, so the most recent failure
/// is last. [`source`][std::error::Error::source] is the most recent failure.
#[derive(Debug)]
pub struct RouteError {
    failures: Vec<ConnectError>,
}

impl RouteError {
    /// Start a route error with its first failure.
    pub fn new(first: ConnectError) -> Self {
        Self {
            failures: vec![first],
        }
    }

    /// Record a later failure.
    pub fn push(&mut self, error: ConnectError) {
        self.failures.push(error);
    }

    /// The first failure.
    pub fn first_connect_error(&self) -> &ConnectError {
        &self.failures[0]
    }

    /// The most recent failure.
    pub fn last_connect_error(&self) -> &ConnectError {
        &self.failures[self.failures.len() - 1]
    }

    /// Every failure, most recent last.
    pub fn failures(&self) -> &[ConnectError] {
        &self.failures
    }

    /// Consume the error, returning every failure, most recent last.
    pub fn into_failures(self) -> Vec<ConnectError> {
        self.failures
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all routes failed after {} attempt(s); last error: {}",
            self.failures.len(),
            self.last_connect_error()
        )
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.last_connect_error())
    }
}
