//! Route selection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use super::database::RouteDatabase;
use super::proxy::{Proxy, ProxyAddress};
use super::{Endpoint, Route};
use crate::connect::ConnectError;
use crate::{Address, Error};

/// Selects routes to connect to an origin server.
///
/// Each connection requires a choice of proxy server and IP address. Proxies are
/// visited in order, and for each proxy every resolved endpoint is offered in the
/// resolver's order. Routes recorded in the [`RouteDatabase`] as recently failed are
/// set aside and offered only once every fresh route has been handed out.
///
/// A selector is owned by one call and is not shared.
#[derive(Debug)]
pub struct RouteSelector {
    address: Address,
    database: Arc<RouteDatabase>,

    // The most recently attempted proxy.
    last_proxy: Option<Proxy>,

    proxies: Vec<Proxy>,
    next_proxy: usize,

    endpoints: Vec<Endpoint>,
    next_endpoint: usize,

    postponed: VecDeque<Route>,
}

impl RouteSelector {
    /// Create a selector for `address`.
    ///
    /// The address's explicit proxy is used if it has one. Otherwise the proxy
    /// selector is asked, and an empty answer means a direct connection.
    pub fn new(address: Address, database: Arc<RouteDatabase>) -> Self {
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let proxies = address.proxy_selector().select(address.url());
                if proxies.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    proxies
                }
            }
        };

        tracing::trace!(host = %address.host(), ?proxies, "selecting routes");

        Self {
            address,
            database,
            last_proxy: None,
            proxies,
            next_proxy: 0,
            endpoints: Vec::new(),
            next_endpoint: 0,
            postponed: VecDeque::new(),
        }
    }

    /// The address routes are selected for.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns `true` if there's another route to attempt.
    ///
    /// Every address has at least one route, so this is `true` for a new selector.
    pub fn has_next(&self) -> bool {
        self.has_next_endpoint() || self.has_next_proxy() || !self.postponed.is_empty()
    }

    /// The next route to attempt.
    ///
    /// Fails with [`Error::RouteExhausted`] if [`has_next`][Self::has_next] is
    /// `false`. Resolver failures and proxies which can't be routed to are reported
    /// immediately, without moving on to later proxies.
    pub fn next(&mut self) -> Result<Route, Error> {
        loop {
            if !self.has_next_endpoint() {
                if !self.has_next_proxy() {
                    return match self.postponed.pop_front() {
                        Some(route) => {
                            tracing::trace!(%route, "retrying postponed route");
                            Ok(route)
                        }
                        None => Err(Error::RouteExhausted {
                            host: self.address.host().to_owned(),
                        }),
                    };
                }
                self.last_proxy = Some(self.next_proxy()?);
            }

            let endpoint = self.next_endpoint()?;
            let proxy = self.last_proxy.clone().unwrap_or(Proxy::Direct);
            let route = Route::new(self.address.clone(), proxy, endpoint)?;

            if self.database.should_postpone(&route) {
                tracing::trace!(%route, "postponing recently failed route");
                self.postponed.push_back(route);
                continue;
            }

            return Ok(route);
        }
    }

    /// Report a failure connecting with `route`.
    ///
    /// The proxy selector hears about failures through proxies, and the route is
    /// recorded in the shared database so later selectors try it last.
    pub fn connect_failed(&mut self, route: &Route, error: &ConnectError) {
        if let Some(proxy) = route.proxy().address() {
            self.address
                .proxy_selector()
                .connect_failed(self.address.url(), proxy, error);
        }

        self.database.failed(route);
    }

    fn has_next_proxy(&self) -> bool {
        self.next_proxy < self.proxies.len()
    }

    fn next_proxy(&mut self) -> Result<Proxy, Error> {
        let Some(proxy) = self.proxies.get(self.next_proxy).cloned() else {
            return Err(Error::NoRouteToHost {
                host: self.address.host().to_owned(),
                reason: format!("exhausted proxy configurations: {:?}", self.proxies),
            });
        };
        self.next_proxy += 1;
        self.reset_endpoints(&proxy)?;
        Ok(proxy)
    }

    /// Prepare the endpoints to attempt for `proxy`.
    fn reset_endpoints(&mut self, proxy: &Proxy) -> Result<(), Error> {
        self.endpoints.clear();
        self.next_endpoint = 0;

        let (host, port): (&str, u16) = match proxy {
            Proxy::Direct | Proxy::Socks(_) => (self.address.host(), self.address.port()),
            Proxy::Http(ProxyAddress::Inet { host, port }) => (&**host, *port),
            Proxy::Http(address @ ProxyAddress::Unix(_)) => {
                return Err(Error::InvalidProxyConfiguration(format!(
                    "proxy address {address} is not an internet socket address"
                )));
            }
        };

        if port == 0 {
            return Err(Error::InvalidProxyConfiguration(format!(
                "no route to {host}:{port}; port is out of range"
            )));
        }

        if matches!(proxy, Proxy::Socks(_)) {
            self.endpoints.push(Endpoint::Unresolved {
                host: host.into(),
                port,
            });
            return Ok(());
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = self
            .address
            .dns()
            .lookup(host)
            .map_err(|source| Error::UnknownHost {
                host: host.to_owned(),
                source,
            })?;

        tracing::trace!(%host, count = addrs.len(), "resolved endpoints");
        self.endpoints.extend(
            addrs
                .into_iter()
                .map(|ip| Endpoint::Resolved(SocketAddr::new(ip, port))),
        );
        Ok(())
    }

    fn has_next_endpoint(&self) -> bool {
        self.next_endpoint < self.endpoints.len()
    }

    fn next_endpoint(&mut self) -> Result<Endpoint, Error> {
        let Some(endpoint) = self.endpoints.get(self.next_endpoint).cloned() else {
            return Err(Error::NoRouteToHost {
                host: self.address.host().to_owned(),
                reason: format!("exhausted inet socket addresses: {:?}", self.endpoints),
            });
        };
        self.next_endpoint += 1;
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use http::Uri;
    use parking_lot::Mutex;

    use super::*;
    use crate::address::tests::builder;
    use crate::dns::{Dns, StaticResolver};
    use crate::route::proxy::{FixedProxySelector, ProxySelector};

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[derive(Debug, Default)]
    struct RecordingSelector {
        proxies: Vec<Proxy>,
        failures: Mutex<Vec<(Uri, ProxyAddress)>>,
    }

    impl ProxySelector for RecordingSelector {
        fn select(&self, _uri: &Uri) -> Vec<Proxy> {
            self.proxies.clone()
        }

        fn connect_failed(&self, uri: &Uri, proxy: &ProxyAddress, _error: &ConnectError) {
            self.failures.lock().push((uri.clone(), proxy.clone()));
        }
    }

    #[derive(Debug)]
    struct FailingDns;

    impl Dns for FailingDns {
        fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            Err(io::Error::new(io::ErrorKind::NotFound, host.to_owned()))
        }
    }

    #[derive(Debug)]
    struct EmptyDns;

    impl Dns for EmptyDns {
        fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            Ok(Vec::new())
        }
    }

    fn resolver() -> Arc<dyn Dns> {
        Arc::new(StaticResolver::new([V6, V4]))
    }

    fn refused() -> ConnectError {
        ConnectError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[test]
    fn direct_routes_in_resolver_order() {
        let _ = tracing_subscriber::fmt::try_init();
        let address = builder("example.com", 80).dns(resolver()).build().unwrap();
        let mut selector = RouteSelector::new(address, Default::default());

        assert!(selector.has_next());
        let first = selector.next().unwrap();
        assert_eq!(first.proxy(), &Proxy::Direct);
        assert_eq!(first.endpoint(), &Endpoint::Resolved(SocketAddr::new(V6, 80)));

        let second = selector.next().unwrap();
        assert_eq!(second.endpoint(), &Endpoint::Resolved(SocketAddr::new(V4, 80)));

        assert!(!selector.has_next());
        assert!(matches!(
            selector.next().unwrap_err(),
            Error::RouteExhausted { .. }
        ));
    }

    #[test]
    fn explicit_proxy_bypasses_selector() {
        let selector = Arc::new(RecordingSelector {
            proxies: vec![Proxy::http("ignored.example", 1)],
            ..Default::default()
        });
        let address = builder("example.com", 80)
            .dns(resolver())
            .proxy(Proxy::http("proxy.example", 3128))
            .proxy_selector(selector)
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address, Default::default());
        let route = routes.next().unwrap();
        assert_eq!(route.proxy(), &Proxy::http("proxy.example", 3128));
        assert_eq!(route.endpoint().port(), 3128);
    }

    #[test]
    fn empty_selection_is_direct() {
        let address = builder("example.com", 80)
            .dns(resolver())
            .proxy_selector(Arc::new(FixedProxySelector::new([])))
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address, Default::default());
        assert_eq!(routes.next().unwrap().proxy(), &Proxy::Direct);
    }

    #[test]
    fn socks_endpoints_are_unresolved() {
        let address = builder("example.com", 8080)
            .dns(Arc::new(FailingDns))
            .proxy(Proxy::socks("socks.example", 1080))
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address, Default::default());
        let route = routes.next().unwrap();
        assert_eq!(
            route.endpoint(),
            &Endpoint::Unresolved {
                host: "example.com".into(),
                port: 8080
            }
        );
        assert!(!routes.has_next());
    }

    #[test]
    fn resolver_failures_propagate() {
        let address = builder("example.com", 80)
            .dns(Arc::new(FailingDns))
            .build()
            .unwrap();
        let mut routes = RouteSelector::new(address, Default::default());
        assert!(matches!(
            routes.next().unwrap_err(),
            Error::UnknownHost { ref host, .. } if host == "example.com"
        ));

        let address = builder("example.com", 80)
            .dns(Arc::new(EmptyDns))
            .build()
            .unwrap();
        let mut routes = RouteSelector::new(address, Default::default());
        assert!(matches!(
            routes.next().unwrap_err(),
            Error::NoRouteToHost { .. }
        ));
    }

    #[test]
    fn invalid_proxies_propagate() {
        let address = builder("example.com", 80)
            .dns(resolver())
            .proxy_selector(Arc::new(FixedProxySelector::new([
                Proxy::Http(ProxyAddress::Unix("/run/proxy.sock".into())),
                Proxy::Direct,
            ])))
            .build()
            .unwrap();
        let mut routes = RouteSelector::new(address, Default::default());
        assert!(matches!(
            routes.next().unwrap_err(),
            Error::InvalidProxyConfiguration(_)
        ));

        let address = builder("example.com", 80)
            .dns(resolver())
            .proxy(Proxy::http("proxy.example", 0))
            .build()
            .unwrap();
        let mut routes = RouteSelector::new(address, Default::default());
        assert!(matches!(
            routes.next().unwrap_err(),
            Error::InvalidProxyConfiguration(_)
        ));
    }

    #[test]
    fn connect_failed_notifies_selector_for_proxies() {
        let selector = Arc::new(RecordingSelector {
            proxies: vec![Proxy::http("proxy.example", 3128), Proxy::Direct],
            ..Default::default()
        });
        let database = Arc::new(RouteDatabase::new());
        let address = builder("example.com", 80)
            .dns(Arc::new(StaticResolver::new([V4])))
            .proxy_selector(selector.clone())
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address, database.clone());

        let proxied = routes.next().unwrap();
        routes.connect_failed(&proxied, &refused());
        assert!(database.should_postpone(&proxied));

        let direct = routes.next().unwrap();
        assert!(direct.proxy().is_direct());
        routes.connect_failed(&direct, &refused());
        assert!(database.should_postpone(&direct));

        let failures = selector.failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].1,
            ProxyAddress::Inet {
                host: "proxy.example".into(),
                port: 3128
            }
        );
    }

    #[test]
    fn postponed_routes_come_last_in_order() {
        let database = Arc::new(RouteDatabase::new());
        let address = builder("example.com", 80)
            .dns(Arc::new(StaticResolver::new([
                IpAddr::from([192, 0, 2, 1]),
                IpAddr::from([192, 0, 2, 2]),
                IpAddr::from([192, 0, 2, 3]),
            ])))
            .build()
            .unwrap();

        let mut routes = RouteSelector::new(address.clone(), database.clone());
        let all: Vec<Route> = std::iter::from_fn(|| routes.has_next().then(|| routes.next().unwrap()))
            .collect();
        assert_eq!(all.len(), 3);

        database.failed(&all[0]);
        database.failed(&all[1]);

        let mut routes = RouteSelector::new(address, database);
        let order: Vec<Route> = std::iter::from_fn(|| routes.has_next().then(|| routes.next().unwrap()))
            .collect();
        assert_eq!(order, vec![all[2].clone(), all[0].clone(), all[1].clone()]);
    }
}
