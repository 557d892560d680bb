//! Proxies and proxy selection.

use std::fmt;
use std::sync::{Arc, OnceLock};

use camino::Utf8PathBuf;
use http::Uri;

use crate::connect::ConnectError;

/// Where a proxy server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyAddress {
    /// A host name (or IP literal) and port.
    Inet {
        /// The proxy host.
        host: Box<str>,

        /// The proxy port.
        port: u16,
    },

    /// A Unix domain socket. Routes can't be built through these.
    Unix(Utf8PathBuf),
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyAddress::Inet { host, port } => write!(f, "{host}:{port}"),
            ProxyAddress::Unix(path) => write!(f, "unix:{path}"),
        }
    }
}

/// How a connection reaches its destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect directly to the origin server.
    Direct,

    /// An HTTP proxy. HTTPS requests are tunnelled through it with `CONNECT`.
    Http(ProxyAddress),

    /// A SOCKS proxy, which resolves the origin's host name itself.
    Socks(ProxyAddress),
}

impl Proxy {
    /// An HTTP proxy at `host:port`.
    pub fn http(host: impl Into<Box<str>>, port: u16) -> Self {
        Proxy::Http(ProxyAddress::Inet {
            host: host.into(),
            port,
        })
    }

    /// A SOCKS proxy at `host:port`.
    pub fn socks(host: impl Into<Box<str>>, port: u16) -> Self {
        Proxy::Socks(ProxyAddress::Inet {
            host: host.into(),
            port,
        })
    }

    /// Is this a direct connection?
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    /// The proxy's own address, or `None` for direct connections.
    pub fn address(&self) -> Option<&ProxyAddress> {
        match self {
            Proxy::Direct => None,
            Proxy::Http(address) | Proxy::Socks(address) => Some(address),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("DIRECT"),
            Proxy::Http(address) => write!(f, "HTTP @ {address}"),
            Proxy::Socks(address) => write!(f, "SOCKS @ {address}"),
        }
    }
}

/// Chooses the proxies to use for a target URI.
pub trait ProxySelector: fmt::Debug + Send + Sync + 'static {
    /// Proxies to try for `uri`, in order. An empty list means "connect directly".
    fn select(&self, uri: &Uri) -> Vec<Proxy>;

    /// Told when a connection through `proxy` failed.
    fn connect_failed(&self, uri: &Uri, proxy: &ProxyAddress, error: &ConnectError) {
        let _ = (uri, proxy, error);
    }
}

/// Always connect directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxySelector;

impl ProxySelector for NoProxySelector {
    fn select(&self, _uri: &Uri) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// The process-wide default proxy selector, which connects directly.
pub fn system() -> Arc<dyn ProxySelector> {
    static SYSTEM: OnceLock<Arc<dyn ProxySelector>> = OnceLock::new();
    SYSTEM.get_or_init(|| Arc::new(NoProxySelector)).clone()
}

/// Offers the same list of proxies for every URI.
#[derive(Debug, Clone, Default)]
pub struct FixedProxySelector {
    proxies: Vec<Proxy>,
}

impl FixedProxySelector {
    /// Select `proxies`, in order, for every URI.
    pub fn new(proxies: impl IntoIterator<Item = Proxy>) -> Self {
        Self {
            proxies: proxies.into_iter().collect(),
        }
    }
}

impl ProxySelector for FixedProxySelector {
    fn select(&self, _uri: &Uri) -> Vec<Proxy> {
        self.proxies.clone()
    }

    fn connect_failed(&self, uri: &Uri, proxy: &ProxyAddress, error: &ConnectError) {
        tracing::debug!(%uri, %proxy, %error, "connection through proxy failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Proxy::Direct.to_string(), "DIRECT");
        assert_eq!(
            Proxy::http("proxy.example", 3128).to_string(),
            "HTTP @ proxy.example:3128"
        );
        assert_eq!(
            Proxy::Socks(ProxyAddress::Unix("/run/socks.sock".into())).to_string(),
            "SOCKS @ unix:/run/socks.sock"
        );
    }

    #[test]
    fn addresses() {
        assert!(Proxy::Direct.is_direct());
        assert_eq!(Proxy::Direct.address(), None);
        assert_eq!(
            Proxy::socks("socks.example", 1080).address(),
            Some(&ProxyAddress::Inet {
                host: "socks.example".into(),
                port: 1080
            })
        );
    }

    #[test]
    fn selectors() {
        let uri: Uri = "http://example.com/".parse().unwrap();
        assert_eq!(NoProxySelector.select(&uri), vec![Proxy::Direct]);

        let fixed = FixedProxySelector::new([Proxy::http("a", 1), Proxy::Direct]);
        assert_eq!(fixed.select(&uri), vec![Proxy::http("a", 1), Proxy::Direct]);

        assert!(crate::same_instance(&system(), &system()));
    }
}
