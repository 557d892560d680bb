//! Connection targets.
//!
//! An [`Address`] describes an origin server together with every policy needed to
//! connect to it: the resolver, the socket factory, the proxy configuration and, for
//! `https` origins, the TLS policy. Requests which share an address may share
//! connections.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use http::Uri;
use thiserror::Error;

use crate::connect::SocketFactory;
use crate::dns::Dns;
use crate::route::proxy::{Proxy, ProxySelector};
use crate::tls::spec::ConnectionSpec;
use crate::tls::TlsPolicy;
use crate::{DebugLiteral, Error};

/// Application protocols negotiated over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// HTTP/1.0, plaintext framing without persistent connections by default.
    Http10,

    /// HTTP/1.1, plaintext framing with persistent connections.
    Http11,

    /// HTTP/2, binary framing with multiplexed streams.
    Http2,
}

impl Protocol {
    /// The protocol's ALPN identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }

    /// The protocol's ALPN identifier, as bytes on the wire.
    pub fn alpn(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ALPN identifier did not name a known protocol.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unexpected protocol: {0}")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http/1.0" => Ok(Protocol::Http10),
            "http/1.1" => Ok(Protocol::Http11),
            "h2" => Ok(Protocol::Http2),
            _ => Err(UnknownProtocol(s.to_owned())),
        }
    }
}

/// Responds to a proxy's authentication challenge.
///
/// When a proxy answers a tunnel request with `407 Proxy Authentication Required`,
/// the authenticator is handed the route and the response, and returns the request
/// to send next (usually the original request with a `Proxy-Authorization` header),
/// or `None` to give up.
pub trait Authenticator: fmt::Debug + Send + Sync + 'static {
    /// Build a follow up request which satisfies the challenge in `response`.
    fn authenticate(
        &self,
        route: Option<&crate::Route>,
        response: &http::Response<()>,
    ) -> Option<http::Request<()>>;
}

/// An authenticator which never knows any credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(
        &self,
        _route: Option<&crate::Route>,
        _response: &http::Response<()>,
    ) -> Option<http::Request<()>> {
        None
    }
}

/// The process-wide [`NoAuthenticator`].
pub fn no_authenticator() -> Arc<dyn Authenticator> {
    static NONE: OnceLock<Arc<dyn Authenticator>> = OnceLock::new();
    NONE.get_or_init(|| Arc::new(NoAuthenticator)).clone()
}

/// A description of how to connect to an origin server.
///
/// For simple connections this is the server's host name and port. If an explicit
/// proxy is requested, that proxy is included too. For secure connections the
/// address also carries the [`TlsPolicy`].
///
/// Addresses are cheap to clone and immutable once built.
#[derive(Clone)]
pub struct Address {
    inner: Arc<AddressInner>,
}

struct AddressInner {
    uri: Uri,
    host: Box<str>,
    port: u16,
    dns: Arc<dyn Dns>,
    socket_factory: Arc<dyn SocketFactory>,
    proxy_authenticator: Arc<dyn Authenticator>,
    protocols: Arc<[Protocol]>,
    connection_specs: Arc<[ConnectionSpec]>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy: Option<Proxy>,
    tls: Option<TlsPolicy>,
}

impl Address {
    /// Start building an address for `host` and `port`.
    pub fn builder(host: impl Into<String>, port: u16) -> AddressBuilder {
        AddressBuilder::new(host, port)
    }

    /// The origin, as a URI with only a scheme and authority.
    pub fn url(&self) -> &Uri {
        &self.inner.uri
    }

    /// The origin's host name (or IP literal, without brackets).
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The origin's port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Is this an `https` origin?
    pub fn is_secure(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// The resolver used to look up the origin and proxy hosts.
    pub fn dns(&self) -> &Arc<dyn Dns> {
        &self.inner.dns
    }

    /// The factory for new TCP sockets.
    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.inner.socket_factory
    }

    /// Answers challenges from proxies.
    pub fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.proxy_authenticator
    }

    /// Protocols the client supports, most preferred first.
    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    /// TLS configurations to try, most preferred first.
    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.inner.connection_specs
    }

    /// The proxy selector, consulted only when there is no explicit [`proxy`][Self::proxy].
    pub fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.inner.proxy_selector
    }

    /// The explicitly requested proxy, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.inner.proxy.as_ref()
    }

    /// TLS policy, present exactly when the address is secure.
    pub fn tls(&self) -> Option<&TlsPolicy> {
        self.inner.tls.as_ref()
    }

    /// Compare every field except the host.
    ///
    /// Two addresses which are equal apart from their host can share a connection
    /// when the connection's certificate covers both hosts.
    pub fn equals_non_host(&self, other: &Address) -> bool {
        let (a, b) = (&*self.inner, &*other.inner);
        crate::same_instance(&a.dns, &b.dns)
            && crate::same_instance(&a.proxy_authenticator, &b.proxy_authenticator)
            && a.protocols == b.protocols
            && a.connection_specs == b.connection_specs
            && crate::same_instance(&a.proxy_selector, &b.proxy_selector)
            && a.proxy == b.proxy
            && a.tls == b.tls
            && crate::same_instance(&a.socket_factory, &b.socket_factory)
            && a.port == b.port
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.host == other.inner.host && self.equals_non_host(other))
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let inner = &*self.inner;
        inner.host.hash(state);
        inner.port.hash(state);
        crate::hash_instance(&inner.dns, state);
        crate::hash_instance(&inner.socket_factory, state);
        crate::hash_instance(&inner.proxy_authenticator, state);
        inner.protocols.hash(state);
        inner.connection_specs.hash(state);
        crate::hash_instance(&inner.proxy_selector, state);
        inner.proxy.hash(state);
        inner.tls.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &*self.inner;
        let mut dbg = f.debug_struct("Address");
        dbg.field(
            "origin",
            &DebugLiteral(format_args!("{}:{}", inner.host, inner.port)),
        );
        match &inner.proxy {
            Some(proxy) => dbg.field("proxy", proxy),
            None => dbg.field("proxy_selector", &inner.proxy_selector),
        };
        dbg.field("protocols", &inner.protocols)
            .field("secure", &inner.tls.is_some())
            .finish()
    }
}

/// Builder for [`Address`].
///
/// The resolver, socket factory, proxy authenticator, protocol list, connection spec
/// list and proxy selector are all required. [`Client`][crate::Client] supplies the
/// system defaults for each of these.
#[derive(Debug)]
pub struct AddressBuilder {
    host: String,
    port: u16,
    dns: Option<Arc<dyn Dns>>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    protocols: Option<Vec<Protocol>>,
    connection_specs: Option<Vec<ConnectionSpec>>,
    proxy_selector: Option<Arc<dyn ProxySelector>>,
    proxy: Option<Proxy>,
    tls: Option<TlsPolicy>,
}

impl AddressBuilder {
    fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            dns: None,
            socket_factory: None,
            proxy_authenticator: None,
            protocols: None,
            connection_specs: None,
            proxy_selector: None,
            proxy: None,
            tls: None,
        }
    }

    /// Set the resolver.
    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Set the socket factory.
    pub fn socket_factory(mut self, socket_factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(socket_factory);
        self
    }

    /// Set the proxy authenticator.
    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = Some(authenticator);
        self
    }

    /// Set the supported protocols, most preferred first.
    pub fn protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.protocols = Some(protocols.into_iter().collect());
        self
    }

    /// Set the TLS configurations, most preferred first.
    pub fn connection_specs(mut self, specs: impl IntoIterator<Item = ConnectionSpec>) -> Self {
        self.connection_specs = Some(specs.into_iter().collect());
        self
    }

    /// Set the proxy selector.
    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = Some(selector);
        self
    }

    /// Use exactly this proxy, bypassing the proxy selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Make this an `https` address with the given TLS policy.
    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = Some(policy);
        self
    }

    /// Validate and build the address.
    pub fn build(self) -> Result<Address, Error> {
        let missing = |what: &str| Error::InvalidAddress(format!("{what} is required"));

        let dns = self.dns.ok_or_else(|| missing("dns"))?;
        let socket_factory = self
            .socket_factory
            .ok_or_else(|| missing("socket factory"))?;
        let proxy_authenticator = self
            .proxy_authenticator
            .ok_or_else(|| missing("proxy authenticator"))?;
        let protocols = self.protocols.ok_or_else(|| missing("protocols"))?;
        let connection_specs = self
            .connection_specs
            .ok_or_else(|| missing("connection specs"))?;
        let proxy_selector = self
            .proxy_selector
            .ok_or_else(|| missing("proxy selector"))?;

        if !protocols.contains(&Protocol::Http11) {
            return Err(Error::InvalidAddress(format!(
                "protocols must contain http/1.1: {protocols:?}"
            )));
        }
        if protocols.contains(&Protocol::Http10) {
            return Err(Error::InvalidAddress(format!(
                "protocols must not contain http/1.0: {protocols:?}"
            )));
        }

        if self.port == 0 {
            return Err(Error::InvalidAddress("unexpected port: 0".into()));
        }

        // Host names are case insensitive, so they're kept in lowercase.
        let host = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(Error::InvalidAddress("host is required".into()));
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let authority = if host.contains(':') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        };
        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query("/")
            .build()
            .map_err(|error| Error::InvalidAddress(format!("unexpected host {host}: {error}")))?;

        Ok(Address {
            inner: Arc::new(AddressInner {
                uri,
                host: host.into(),
                port: self.port,
                dns,
                socket_factory,
                proxy_authenticator,
                protocols: protocols.into(),
                connection_specs: connection_specs.into(),
                proxy_selector,
                proxy: self.proxy,
                tls: self.tls,
            }),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::IpAddr;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::connect::tcp::TcpSocketFactory;
    use crate::dns::StaticResolver;
    use crate::route::proxy::NoProxySelector;
    use crate::tls::{CipherSuite, SecureSocketFactory, TlsSocket, TlsVersion};

    assert_impl_all!(Address: Send, Sync, Clone);

    /// An address builder with the shared defaults filled in.
    pub(crate) fn builder(host: &str, port: u16) -> AddressBuilder {
        Address::builder(host, port)
            .dns(crate::dns::system())
            .socket_factory(crate::connect::tcp::system())
            .proxy_authenticator(no_authenticator())
            .protocols([Protocol::Http2, Protocol::Http11])
            .connection_specs([ConnectionSpec::MODERN_TLS, ConnectionSpec::CLEARTEXT])
            .proxy_selector(crate::route::proxy::system())
    }

    #[test]
    fn protocol_names() {
        for protocol in [Protocol::Http10, Protocol::Http11, Protocol::Http2] {
            assert_eq!(protocol.as_str().parse::<Protocol>().unwrap(), protocol);
        }
        assert!("spdy/3.1".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Http2.alpn(), b"h2");
    }

    #[test]
    fn requires_capabilities() {
        let error = Address::builder("example.com", 80).build().unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));

        let error = builder("example.com", 80)
            .protocols([Protocol::Http2])
            .build()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));

        let error = builder("example.com", 80)
            .protocols([Protocol::Http11, Protocol::Http10])
            .build()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));

        let error = builder("example.com", 0).build().unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));

        let error = builder("", 80).build().unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));
    }

    #[test]
    fn url_has_only_scheme_and_authority() {
        let address = builder("example.com", 8080).build().unwrap();
        assert_eq!(address.url().to_string(), "http://example.com:8080/");
        assert!(!address.is_secure());

        let address = builder("[::1]", 443).build().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.url().to_string(), "http://[::1]:443/");

        let factory: Arc<dyn SecureSocketFactory> = Arc::new(TlsSocket::new(
            [CipherSuite::TLS_AES_128_GCM_SHA256],
            [TlsVersion::Tls13],
        ));
        let address = builder("example.com", 443)
            .tls(TlsPolicy::new(factory))
            .build()
            .unwrap();
        assert!(address.is_secure());
        assert_eq!(address.url().scheme_str(), Some("https"));
    }

    #[test]
    fn hosts_are_lowercased() {
        let address = builder("Example.COM", 80).build().unwrap();
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.url().to_string(), "http://example.com:80/");
        assert_eq!(address, builder("example.com", 80).build().unwrap());

        let address = builder("[FE80::1]", 80).build().unwrap();
        assert_eq!(address.host(), "fe80::1");
    }

    #[test]
    fn equality_is_deep() {
        let a = builder("example.com", 80).build().unwrap();
        let b = builder("example.com", 80).build().unwrap();
        assert_eq!(a, b);

        let hash = |address: &Address| {
            use std::collections::hash_map::DefaultHasher;
            let mut hasher = DefaultHasher::new();
            address.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(&a), hash(&b));

        let other_host = builder("example.org", 80).build().unwrap();
        assert_ne!(a, other_host);
        assert!(a.equals_non_host(&other_host));

        let other_port = builder("example.com", 8080).build().unwrap();
        assert_ne!(a, other_port);
        assert!(!a.equals_non_host(&other_port));

        let other_dns = builder("example.com", 80)
            .dns(Arc::new(StaticResolver::new([IpAddr::from([127, 0, 0, 1])])))
            .build()
            .unwrap();
        assert_ne!(a, other_dns);

        let other_factory = builder("example.com", 80)
            .socket_factory(Arc::new(TcpSocketFactory::default()))
            .build()
            .unwrap();
        assert!(!a.equals_non_host(&other_factory));

        let other_selector = builder("example.com", 80)
            .proxy_selector(Arc::new(NoProxySelector))
            .build()
            .unwrap();
        assert!(!a.equals_non_host(&other_selector));

        let other_specs = builder("example.com", 80)
            .connection_specs([ConnectionSpec::CLEARTEXT])
            .build()
            .unwrap();
        assert!(!a.equals_non_host(&other_specs));

        let proxied = builder("example.com", 80)
            .proxy(Proxy::http("proxy.example", 3128))
            .build()
            .unwrap();
        assert!(!a.equals_non_host(&proxied));
    }
}
