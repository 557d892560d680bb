//! Connection spec fallback.

use super::spec::ConnectionSpec;
use super::SecureSocket;
use crate::connect::ConnectError;
use crate::Error;

/// Walks an ordered list of [`ConnectionSpec`]s for one connection attempt.
///
/// When a secure connection fails because of a handshake or protocol problem, the
/// connection may be retried with a less capable spec. A selector is stateful, and is
/// created fresh for each route.
#[derive(Debug, Clone)]
pub struct ConnectionSpecSelector {
    specs: Vec<ConnectionSpec>,
    next_index: usize,
    fallback_possible: bool,
    is_fallback: bool,
}

impl ConnectionSpecSelector {
    /// Create a selector over `specs`, most preferred first.
    pub fn new(specs: impl Into<Vec<ConnectionSpec>>) -> Self {
        Self {
            specs: specs.into(),
            next_index: 0,
            fallback_possible: false,
            is_fallback: false,
        }
    }

    /// Has an attempt with this selector already failed?
    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    /// Would a later spec be compatible with the last configured socket?
    pub fn is_fallback_possible(&self) -> bool {
        self.fallback_possible
    }

    /// Configure `socket` with the next compatible spec, and return that spec.
    ///
    /// Specs are scanned from where the last call left off. It is an error if none of
    /// the remaining specs is compatible with the socket, either because this is the
    /// first attempt and the socket supports none of them, or because a retry got a
    /// socket which supports less than the one before.
    pub fn configure_secure_socket<S>(&mut self, socket: &mut S) -> Result<ConnectionSpec, Error>
    where
        S: SecureSocket + ?Sized,
    {
        let Some(offset) = self.specs[self.next_index..]
            .iter()
            .position(|spec| spec.is_compatible(socket))
        else {
            return Err(Error::NoCompatibleTlsConfig {
                is_fallback: self.is_fallback,
                specs: format!("{:?}", self.specs),
                enabled_protocols: socket.enabled_protocols().to_vec(),
            });
        };

        let index = self.next_index + offset;
        self.next_index = index + 1;

        // Assumes later sockets will have the same capabilities as this one.
        self.fallback_possible = self.specs[self.next_index..]
            .iter()
            .any(|spec| spec.is_compatible(socket));

        let spec = self.specs[index].clone();
        tracing::trace!(
            ?spec,
            is_fallback = self.is_fallback,
            fallback_possible = self.fallback_possible,
            "configured secure socket"
        );
        spec.apply(socket, self.is_fallback);
        Ok(spec)
    }

    /// Report a failed connection attempt, returning `true` if it should be retried
    /// with [`configure_secure_socket`][Self::configure_secure_socket].
    ///
    /// Any later attempt with this selector is a fallback attempt, whatever the answer.
    pub fn connection_failed(&mut self, error: &ConnectError) -> bool {
        self.is_fallback = true;

        if !self.fallback_possible {
            tracing::trace!("no fallback connection spec remains");
            return false;
        }

        let retry = match error {
            // Certificate problems won't be fixed by offering older protocols.
            ConnectError::Handshake(_) => !error.is_certificate_failure(),
            ConnectError::TlsProtocol(_) => true,
            ConnectError::Io(_)
            | ConnectError::Protocol(_)
            | ConnectError::PeerUnverified(_)
            | ConnectError::Canceled => false,
        };

        tracing::debug!(%error, retry, "connection attempt failed");
        retry
    }
}
