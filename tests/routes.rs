use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyperdial::address::{no_authenticator, Protocol};
use hyperdial::dns::Dns;
use hyperdial::route::proxy::{FixedProxySelector, NoProxySelector};
use hyperdial::{
    Address, ConnectError, ConnectionSpec, Endpoint, Error, Proxy, RouteDatabase, RouteSelector,
};

/// Resolves a fixed set of host names.
#[derive(Debug, Default)]
struct Hosts {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    fn with(mut self, host: &str, ips: &[&str]) -> Self {
        self.hosts.insert(
            host.to_owned(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }
}

impl Dns for Hosts {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_owned()))
    }
}

fn address(dns: Hosts, proxies: Vec<Proxy>) -> Address {
    let selector: Arc<dyn hyperdial::ProxySelector> = if proxies.is_empty() {
        Arc::new(NoProxySelector)
    } else {
        Arc::new(FixedProxySelector::new(proxies))
    };

    Address::builder("example.com", 80)
        .dns(Arc::new(dns))
        .socket_factory(hyperdial::connect::tcp::system())
        .proxy_authenticator(no_authenticator())
        .protocols([Protocol::Http11])
        .connection_specs([ConnectionSpec::CLEARTEXT])
        .proxy_selector(selector)
        .build()
        .unwrap()
}

fn drain(selector: &mut RouteSelector) -> Vec<(Proxy, Endpoint)> {
    let mut routes = Vec::new();
    while selector.has_next() {
        let route = selector.next().unwrap();
        routes.push((route.proxy().clone(), route.endpoint().clone()));
    }
    routes
}

fn endpoint(addr: &str) -> Endpoint {
    Endpoint::Resolved(addr.parse::<SocketAddr>().unwrap())
}

#[test]
fn every_proxy_and_endpoint_is_offered() {
    let _ = tracing_subscriber::fmt::try_init();
    let dns = Hosts::default()
        .with("proxy-a.example", &["10.0.0.1", "10.0.0.2"])
        .with("proxy-b.example", &["10.0.1.1", "10.0.1.2", "10.0.1.3"]);
    let address = address(
        dns,
        vec![
            Proxy::http("proxy-a.example", 3128),
            Proxy::http("proxy-b.example", 8080),
        ],
    );

    let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::new()));
    let routes = drain(&mut selector);

    assert_eq!(routes.len(), 5);
    assert_eq!(
        routes,
        vec![
            (Proxy::http("proxy-a.example", 3128), endpoint("10.0.0.1:3128")),
            (Proxy::http("proxy-a.example", 3128), endpoint("10.0.0.2:3128")),
            (Proxy::http("proxy-b.example", 8080), endpoint("10.0.1.1:8080")),
            (Proxy::http("proxy-b.example", 8080), endpoint("10.0.1.2:8080")),
            (Proxy::http("proxy-b.example", 8080), endpoint("10.0.1.3:8080")),
        ]
    );
    assert!(matches!(
        selector.next(),
        Err(Error::RouteExhausted { .. })
    ));
}

#[test]
fn failed_routes_are_tried_last() {
    let dns = Hosts::default().with("example.com", &["192.0.2.1", "192.0.2.2", "192.0.2.3"]);
    let address = address(dns, Vec::new());
    let database = Arc::new(RouteDatabase::new());

    let mut selector = RouteSelector::new(address.clone(), database.clone());
    let first = selector.next().unwrap();
    selector.connect_failed(
        &first,
        &ConnectError::Io(io::ErrorKind::ConnectionRefused.into()),
    );
    assert_eq!(database.len(), 1);

    let mut selector = RouteSelector::new(address.clone(), database.clone());
    let endpoints: Vec<_> = drain(&mut selector)
        .into_iter()
        .map(|(proxy, endpoint)| {
            assert!(proxy.is_direct());
            endpoint
        })
        .collect();
    assert_eq!(
        endpoints,
        vec![
            endpoint("192.0.2.2:80"),
            endpoint("192.0.2.3:80"),
            endpoint("192.0.2.1:80"),
        ]
    );

    // A later success erases the failure.
    database.connected(&first);
    let mut selector = RouteSelector::new(address, database.clone());
    assert_eq!(selector.next().unwrap(), first);
    assert!(database.is_empty());
}

#[test]
fn unknown_host() {
    let address = address(Hosts::default(), Vec::new());
    let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::new()));

    assert!(selector.has_next());
    match selector.next() {
        Err(Error::UnknownHost { host, source }) => {
            assert_eq!(host, "example.com");
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn socks_proxies_are_not_resolved() {
    let address = address(
        Hosts::default(),
        vec![Proxy::socks("socks.example", 1080)],
    );
    let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::new()));

    let route = selector.next().unwrap();
    assert_eq!(
        route.endpoint(),
        &Endpoint::Unresolved {
            host: "example.com".into(),
            port: 80
        }
    );
    assert!(!selector.has_next());
}
