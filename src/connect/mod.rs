//! Establishing connections.
//!
//! [`connect()`] is the loop a call runs to obtain a connection: it walks the routes
//! offered by a [`RouteSelector`], and for each route walks the TLS fallbacks decided
//! by a [`ConnectionSpecSelector`], asking a [`Connector`] to dial each combination.
//! Every failed attempt is kept, and reported together in a [`RouteError`] once
//! nothing is left to try.

use std::fmt;
use std::sync::Arc;

use crate::dispatcher::Call;
use crate::route::database::RouteDatabase;
use crate::route::selector::RouteSelector;
use crate::route::Route;
use crate::tls::selector::ConnectionSpecSelector;
use crate::tls::spec::ConnectionSpec;
use crate::tls::TlsSocket;
use crate::{Address, Error};

mod error;
pub mod tcp;
pub mod tunnel;

pub use self::error::{ConnectError, RouteError};
pub use self::tcp::{Connection, SocketFactory, TcpConfig, TcpConnector, TcpSocketFactory};

/// The TLS configuration chosen for one connection attempt.
#[derive(Debug, Clone)]
pub struct TlsHandshake {
    socket: TlsSocket,
    spec: ConnectionSpec,
}

impl TlsHandshake {
    /// A handshake offering what `socket` has enabled, chosen under `spec`.
    pub fn new(socket: TlsSocket, spec: ConnectionSpec) -> Self {
        Self { socket, spec }
    }

    /// The socket's capabilities, already narrowed by the spec.
    pub fn socket(&self) -> &TlsSocket {
        &self.socket
    }

    /// The connection spec in use.
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }
}

/// Dials a single route.
///
/// Connectors do the socket and TLS work the rest of the crate only plans: open a
/// socket to the route's endpoint, tunnel through an HTTP proxy if the route
/// requires it, and perform the TLS handshake described by `tls`.
pub trait Connector: fmt::Debug + Send + Sync {
    /// The established connection.
    type Connection;

    /// Attempt to connect with `route`. `tls` is present exactly when the route's
    /// address is secure.
    fn connect(
        &self,
        route: &Route,
        tls: Option<&TlsHandshake>,
    ) -> Result<Self::Connection, ConnectError>;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    type Connection = C::Connection;

    fn connect(
        &self,
        route: &Route,
        tls: Option<&TlsHandshake>,
    ) -> Result<Self::Connection, ConnectError> {
        (**self).connect(route, tls)
    }
}

/// A connection, and how it was made.
#[derive(Debug)]
pub struct Established<C> {
    /// The route that succeeded.
    pub route: Route,

    /// The connection returned by the connector.
    pub connection: C,

    /// The connection spec used, [`ConnectionSpec::CLEARTEXT`] for plaintext.
    pub connection_spec: ConnectionSpec,
}

/// Connect to `address`, trying every route and TLS fallback until one succeeds.
///
/// Routes come from a fresh [`RouteSelector`] backed by `database`. Secure routes are
/// retried with the next connection spec when the failure suggests a less capable
/// configuration might work. Failed routes are recorded in `database`, and a route
/// that succeeds is cleared from it.
///
/// `call` is checked for cancellation before every attempt. Errors from route and
/// spec selection are returned immediately. Once every route has failed, the
/// returned [`Error::Route`] carries every attempt's failure, most recent last.
#[tracing::instrument(skip_all, level = "debug", fields(host = %address.host(), port = address.port()))]
pub fn connect<C>(
    address: &Address,
    database: &Arc<RouteDatabase>,
    connector: &C,
    call: &Call,
) -> Result<Established<C::Connection>, Error>
where
    C: Connector + ?Sized,
{
    if !address.is_secure() && !address.connection_specs().contains(&ConnectionSpec::CLEARTEXT) {
        return Err(Error::CleartextNotPermitted {
            host: address.host().to_owned(),
        });
    }

    let mut routes = RouteSelector::new(address.clone(), database.clone());
    let mut failures: Option<RouteError> = None;

    while routes.has_next() {
        let route = routes.next()?;
        let mut specs = ConnectionSpecSelector::new(address.connection_specs());

        loop {
            if call.is_canceled() {
                return Err(Error::Canceled);
            }

            let handshake = match address.tls() {
                Some(policy) => {
                    let mut socket = policy.socket_factory().create_socket();
                    let spec = specs.configure_secure_socket(&mut socket)?;
                    Some(TlsHandshake::new(socket, spec))
                }
                None => None,
            };

            tracing::trace!(%route, "connecting");
            match connector.connect(&route, handshake.as_ref()) {
                Ok(connection) => {
                    tracing::debug!(%route, "connected");
                    database.connected(&route);
                    return Ok(Established {
                        route,
                        connection,
                        connection_spec: handshake
                            .map(|handshake| handshake.spec)
                            .unwrap_or(ConnectionSpec::CLEARTEXT),
                    });
                }
                Err(ConnectError::Canceled) => return Err(Error::Canceled),
                Err(error) => {
                    let retry = handshake.is_some() && specs.connection_failed(&error);
                    tracing::debug!(%route, %error, retry, "connection attempt failed");
                    if !retry {
                        routes.connect_failed(&route, &error);
                    }

                    match failures.as_mut() {
                        Some(failures) => failures.push(error),
                        None => failures = Some(RouteError::new(error)),
                    }

                    if !retry {
                        break;
                    }
                }
            }
        }
    }

    Err(match failures {
        Some(failures) => Error::Route(failures),
        None => Error::RouteExhausted {
            host: address.host().to_owned(),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::IpAddr;

    use parking_lot::Mutex;

    use super::*;
    use crate::address::tests::builder;
    use crate::dns::StaticResolver;
    use crate::tls::{CipherSuite, SecureSocketFactory, TlsPolicy, TlsVersion};

    /// Answers each attempt from a script, recording what it was asked.
    #[derive(Debug, Default)]
    struct Scripted {
        outcomes: Mutex<Vec<Result<(), ConnectError>>>,
        attempts: Mutex<Vec<(Route, Option<ConnectionSpec>)>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<(), ConnectError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                attempts: Mutex::default(),
            }
        }
    }

    impl Connector for Scripted {
        type Connection = ();

        fn connect(
            &self,
            route: &Route,
            tls: Option<&TlsHandshake>,
        ) -> Result<(), ConnectError> {
            self.attempts
                .lock()
                .push((route.clone(), tls.map(|tls| tls.spec().clone())));
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                return Err(ConnectError::Io(io::ErrorKind::ConnectionRefused.into()));
            }
            outcomes.remove(0)
        }
    }

    fn two_addresses() -> Arc<StaticResolver> {
        Arc::new(StaticResolver::new([
            IpAddr::from([192, 0, 2, 1]),
            IpAddr::from([192, 0, 2, 2]),
        ]))
    }

    fn refused() -> ConnectError {
        ConnectError::Io(io::ErrorKind::ConnectionRefused.into())
    }

    fn legacy_tls() -> TlsPolicy {
        let factory: Arc<dyn SecureSocketFactory> = Arc::new(TlsSocket::new(
            [CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA],
            [TlsVersion::Tls10],
        ));
        TlsPolicy::new(factory)
    }

    #[test]
    fn cleartext_must_be_permitted() {
        let address = builder("example.com", 80)
            .connection_specs([ConnectionSpec::MODERN_TLS])
            .build()
            .unwrap();
        let connector = Scripted::default();
        let error = connect(&address, &Default::default(), &connector, &Call::new("example.com"))
            .unwrap_err();
        assert!(matches!(error, Error::CleartextNotPermitted { .. }));
        assert!(connector.attempts.lock().is_empty());
    }

    #[test]
    fn moves_on_to_the_next_route() {
        let _ = tracing_subscriber::fmt::try_init();
        let database = Arc::new(RouteDatabase::new());
        let address = builder("example.com", 80)
            .dns(two_addresses())
            .build()
            .unwrap();
        let connector = Scripted::new(vec![Err(refused()), Ok(())]);

        let established = connect(&address, &database, &connector, &Call::new("example.com"))
            .unwrap();
        assert_eq!(established.connection_spec, ConnectionSpec::CLEARTEXT);

        let attempts = connector.attempts.lock();
        assert_eq!(attempts.len(), 2);
        assert!(database.should_postpone(&attempts[0].0));
        assert!(!database.should_postpone(&established.route));
    }

    #[test]
    fn success_clears_postponed_route() {
        let database = Arc::new(RouteDatabase::new());
        let address = builder("example.com", 80)
            .dns(two_addresses())
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address.clone(), database.clone());
        let first = routes.next().unwrap();
        let second = routes.next().unwrap();
        database.failed(&first);
        database.failed(&second);

        let connector = Scripted::new(vec![Ok(())]);
        let established = connect(&address, &database, &connector, &Call::new("example.com"))
            .unwrap();
        assert_eq!(established.route, first);
        assert!(!database.should_postpone(&first));
        assert!(database.should_postpone(&second));
    }

    #[test]
    fn every_failure_is_reported() {
        let address = builder("example.com", 80)
            .dns(two_addresses())
            .build()
            .unwrap();
        let connector = Scripted::new(vec![
            Err(ConnectError::Protocol("first".into())),
            Err(ConnectError::Protocol("second".into())),
        ]);

        let error = connect(&address, &Default::default(), &connector, &Call::new("example.com"))
            .unwrap_err();
        let error = match error {
            Error::Route(error) => error,
            other => panic!("expected a route error, got {other:?}"),
        };
        assert_eq!(error.failures().len(), 2);
        assert_eq!(
            error.last_connect_error().to_string(),
            "protocol error: second"
        );
    }

    #[test]
    fn tls_fallback_retries_the_same_route() {
        let address = builder("example.com", 443)
            .dns(Arc::new(StaticResolver::new([IpAddr::from([192, 0, 2, 1])])))
            .connection_specs([ConnectionSpec::MODERN_TLS, ConnectionSpec::COMPATIBLE_TLS])
            .tls(legacy_tls())
            .build()
            .unwrap();
        let database = Arc::new(RouteDatabase::new());
        let connector = Scripted::new(vec![
            Err(ConnectError::Handshake("handshake_failure".into())),
            Ok(()),
        ]);

        let established = connect(&address, &database, &connector, &Call::new("example.com"))
            .unwrap();
        assert_eq!(established.connection_spec, ConnectionSpec::COMPATIBLE_TLS);

        let attempts = connector.attempts.lock();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0, attempts[1].0);
        assert_eq!(attempts[0].1, Some(ConnectionSpec::MODERN_TLS));
        assert!(database.is_empty());
    }

    #[test]
    fn incompatible_tls_is_fatal() {
        let factory: Arc<dyn SecureSocketFactory> = Arc::new(TlsSocket::new(
            [CipherSuite::new("TLS_MADE_UP")],
            [TlsVersion::Tls12],
        ));
        let address = builder("example.com", 443)
            .dns(two_addresses())
            .tls(TlsPolicy::new(factory))
            .build()
            .unwrap();
        let connector = Scripted::default();

        let error = connect(&address, &Default::default(), &connector, &Call::new("example.com"))
            .unwrap_err();
        assert!(matches!(error, Error::NoCompatibleTlsConfig { .. }));
        assert!(connector.attempts.lock().is_empty());
    }

    #[test]
    fn cancellation_is_checked_before_each_attempt() {
        let address = builder("example.com", 80)
            .dns(two_addresses())
            .build()
            .unwrap();
        let call = Call::new("example.com");
        call.cancel();

        let connector = Scripted::default();
        let error = connect(&address, &Default::default(), &connector, &call).unwrap_err();
        assert!(matches!(error, Error::Canceled));
        assert!(connector.attempts.lock().is_empty());
    }
}
