//! DNS resolution.
//!
//! Route selection only consumes the [`Dns`] interface: give it a host name, get
//! back the IP addresses to try, in the order they should be tried.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, OnceLock};

/// Resolves host names to IP addresses.
///
/// Implementations must be safe to use from many threads at once. The returned
/// addresses are attempted in order, so a resolver can prefer IPv6 over IPv4 (or
/// vice versa) by ordering its results.
pub trait Dns: fmt::Debug + Send + Sync + 'static {
    /// Look up every IP address for `host`.
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl Dns for GaiResolver {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        tracing::trace_span!("getaddrinfo", %host).in_scope(|| {
            tracing::trace!("dns resolution starting");
            let addrs: Vec<IpAddr> = (host, 0)
                .to_socket_addrs()?
                .map(|addr| addr.ip())
                .collect();

            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{host} resolved to no addresses"),
                ));
            }

            tracing::trace!(count = addrs.len(), "dns resolution complete");
            Ok(addrs)
        })
    }
}

/// The process-wide system resolver.
///
/// Every call returns the same instance, so addresses built with the system
/// resolver compare equal.
pub fn system() -> Arc<dyn Dns> {
    static SYSTEM: OnceLock<Arc<dyn Dns>> = OnceLock::new();
    SYSTEM.get_or_init(|| Arc::new(GaiResolver::new())).clone()
}

/// A resolver which always returns a fixed set of addresses, regardless of host.
///
/// Useful for pinning a host to known addresses, and in tests.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addrs: Vec<IpAddr>,
}

impl StaticResolver {
    /// Create a resolver which returns `addrs` for every lookup.
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }
}

impl Dns for StaticResolver {
    fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        if self.addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} resolved to no addresses"),
            ));
        }
        Ok(self.addrs.clone())
    }
}
