//! Hyperdial
//!
//! Connection acquisition for HTTP clients: turning an origin, a set of proxies, a
//! list of resolved IP addresses and a list of TLS configurations into one usable
//! network path, while bounding how many calls run at once.
//!
//! The crate is organized around a few pieces which can be used on their own:
//!
//! - [`Address`] and [`Route`] describe where a call is going, and one concrete way
//!   of getting there.
//! - [`RouteSelector`] enumerates candidate routes for an address, trying proxies
//!   in order, then every resolved IP address, and deferring routes recorded in the
//!   shared [`RouteDatabase`] as recently failed.
//! - [`ConnectionSpecSelector`] walks an ordered list of [`ConnectionSpec`]s and
//!   decides, from the shape of a handshake failure, whether a fallback attempt is
//!   worth making.
//! - [`Dispatcher`] bounds how many calls run concurrently, globally and per host.
//! - [`connect()`] ties route selection and TLS fallback together around a
//!   [`Connector`], producing either an established connection or a
//!   [`RouteError`] carrying every failed attempt.
//!
//! [`Client`] composes all of these with a [`Config`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod address;
pub mod client;
pub mod connect;
pub mod dispatcher;
pub mod dns;
mod error;
pub mod route;
pub mod tls;

pub use self::address::{Address, Protocol};
pub use self::client::{Client, Config};
pub use self::connect::{connect, ConnectError, Connector, Established, RouteError};
pub use self::dispatcher::{Call, Dispatcher};
pub use self::error::Error;
pub use self::route::database::RouteDatabase;
pub use self::route::proxy::{Proxy, ProxyAddress, ProxySelector};
pub use self::route::selector::RouteSelector;
pub use self::route::{Endpoint, Route};
pub use self::tls::selector::ConnectionSpecSelector;
pub use self::tls::spec::ConnectionSpec;

/// Boxed error type used for opaque error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compare two shared capabilities by identity.
///
/// Capabilities (resolvers, proxy selectors, ...) are trait objects, so the only
/// equality available is "is this the same instance".
pub(crate) fn same_instance<T: ?Sized>(a: &std::sync::Arc<T>, b: &std::sync::Arc<T>) -> bool {
    std::ptr::addr_eq(std::sync::Arc::as_ptr(a), std::sync::Arc::as_ptr(b))
}

/// Hash a shared capability by identity, matching [`same_instance`].
pub(crate) fn hash_instance<T: ?Sized, H: std::hash::Hasher>(arc: &std::sync::Arc<T>, state: &mut H) {
    std::hash::Hash::hash(&(std::sync::Arc::as_ptr(arc) as *const () as usize), state);
}
