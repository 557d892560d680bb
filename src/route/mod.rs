//! Routes: one concrete way to reach an [`Address`].
//!
//! A route names the proxy (or [`Proxy::Direct`]) and the socket endpoint a connection
//! attempt will dial. Route selection lives in [`selector`], and the memory of which
//! routes recently failed lives in [`database`].

use std::fmt;
use std::net::SocketAddr;

use crate::{Address, Error};

pub mod database;
pub mod proxy;
pub mod selector;

use self::proxy::Proxy;

/// The socket endpoint a connection attempt dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// An IP address and port, resolved locally.
    Resolved(SocketAddr),

    /// A host name and port to be resolved by a SOCKS proxy.
    Unresolved {
        /// The host name.
        host: Box<str>,

        /// The port.
        port: u16,
    },
}

impl Endpoint {
    /// The endpoint's port.
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Resolved(addr) => addr.port(),
            Endpoint::Unresolved { port, .. } => *port,
        }
    }

    /// The resolved socket address, if there is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Resolved(addr) => Some(*addr),
            Endpoint::Unresolved { .. } => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Resolved(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Resolved(addr) => write!(f, "{addr}"),
            Endpoint::Unresolved { host, port } => write!(f, "{host}:{port} (unresolved)"),
        }
    }
}

/// The concrete route used by a connection to reach an origin server.
///
/// When creating a connection the client has many options:
///
/// - **HTTP proxy:** a proxy server may be explicitly configured, or chosen by the
///   address's proxy selector.
/// - **IP address:** whether connecting directly to an origin server or through a
///   proxy, opening a socket requires an IP address. The resolver may return several
///   IP addresses to attempt.
///
/// Each route is a specific selection of these options. Routes are compared
/// structurally.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    endpoint: Endpoint,
}

impl Route {
    /// Create a route.
    ///
    /// Only SOCKS proxies accept an unresolved endpoint, and the endpoint's port must
    /// be non-zero.
    pub fn new(address: Address, proxy: Proxy, endpoint: Endpoint) -> Result<Self, Error> {
        if endpoint.port() == 0 {
            return Err(Error::InvalidRoute(format!("{endpoint} has no port")));
        }

        if matches!(endpoint, Endpoint::Unresolved { .. }) && !matches!(proxy, Proxy::Socks(_)) {
            return Err(Error::InvalidRoute(format!(
                "{endpoint} must be resolved unless connecting through a SOCKS proxy"
            )));
        }

        Ok(Self {
            address,
            proxy,
            endpoint,
        })
    }

    /// The address this route reaches.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The proxy used by this route, or [`Proxy::Direct`].
    ///
    /// Note that this may be a different proxy from the one explicitly requested by
    /// the address, when the proxy selector chose it.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The endpoint this route dials: the origin server for direct routes, otherwise
    /// the proxy.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns `true` if this route tunnels HTTPS through an HTTP proxy.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_secure() && matches!(self.proxy, Proxy::Http(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field(
                "origin",
                &crate::DebugLiteral(format_args!(
                    "{}:{}",
                    self.address.host(),
                    self.address.port()
                )),
            )
            .field("proxy", &self.proxy)
            .field("endpoint", &crate::DebugLiteral(&self.endpoint))
            .finish()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Proxy::Direct => write!(f, "{}", self.endpoint),
            proxy => write!(f, "{} via {proxy}", self.endpoint),
        }
    }
}
