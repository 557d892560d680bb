//! Compose route selection, TLS fallback and admission control into a client.
//!
//! A [`Client`] owns the long lived pieces shared by its calls: the capabilities used
//! to build [`Address`]es, one [`RouteDatabase`], one [`Dispatcher`] and a
//! [`Connector`]. It turns request URIs into addresses and runs calls, synchronously
//! on the caller's thread or asynchronously through the dispatcher.

use std::fmt;
use std::sync::Arc;

use http::Uri;

use crate::address::{Address, Authenticator, Protocol};
use crate::connect::{self, Connector, Established, SocketFactory, TcpConfig, TcpConnector};
use crate::dispatcher::{Call, Dispatcher};
use crate::dns::Dns;
use crate::route::database::RouteDatabase;
use crate::route::proxy::{Proxy, ProxySelector};
use crate::tls::spec::ConnectionSpec;
use crate::tls::TlsPolicy;
use crate::{DebugLiteral, Error};

mod builder;

pub use self::builder::Builder;

/// Client configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of asynchronous calls to run at once.
    pub max_requests: usize,

    /// The maximum number of asynchronous calls to run at once for each host.
    pub max_requests_per_host: usize,

    /// Protocols to offer, in order of preference. Must contain `http/1.1`.
    pub protocols: Vec<Protocol>,

    /// Connection specs to try, in order.
    pub connection_specs: Vec<ConnectionSpec>,

    /// TCP options for new connections.
    pub tcp: TcpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_requests: 64,
            max_requests_per_host: 5,
            protocols: vec![Protocol::Http2, Protocol::Http11],
            connection_specs: vec![ConnectionSpec::MODERN_TLS, ConnectionSpec::CLEARTEXT],
            tcp: TcpConfig::default(),
        }
    }
}

/// A client, which can be cheaply cloned and shared between threads.
pub struct Client<C = TcpConnector> {
    inner: Arc<ClientInner<C>>,
}

struct ClientInner<C> {
    config: Config,
    dns: Arc<dyn Dns>,
    socket_factory: Arc<dyn SocketFactory>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn Authenticator>,
    tls: Option<TlsPolicy>,
    dispatcher: Dispatcher,
    routes: Arc<RouteDatabase>,
    connector: C,
}

impl<C> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("proxy", &self.inner.proxy)
            .field("tls", &DebugLiteral(self.inner.tls.is_some()))
            .field("dispatcher", &self.inner.dispatcher)
            .field("connector", &self.inner.connector)
            .finish()
    }
}

impl Client {
    /// A client with the default configuration and capabilities.
    pub fn new() -> Result<Self, Error> {
        Builder::new(Config::default()).build()
    }

    /// Start building a client from `config`.
    pub fn builder(config: Config) -> Builder {
        Builder::new(config)
    }
}

impl<C> Client<C> {
    /// The configuration this client was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The dispatcher admitting this client's calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Routes which recently failed, shared by every call.
    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.routes
    }

    /// The connector opening connections.
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Build the address a request to `uri` connects to.
    ///
    /// Only `http` and `https` are supported. An `https` URI requires the client to
    /// have a TLS policy. Missing ports default to the scheme's port.
    pub fn address(&self, uri: &Uri) -> Result<Address, Error> {
        let secure = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(scheme) => {
                return Err(Error::InvalidAddress(format!(
                    "unexpected scheme: {scheme}"
                )))
            }
            None => return Err(Error::InvalidAddress(format!("missing scheme: {uri}"))),
        };

        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidAddress(format!("missing host: {uri}")))?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let inner = &self.inner;
        let mut builder = Address::builder(host, port)
            .dns(inner.dns.clone())
            .socket_factory(inner.socket_factory.clone())
            .proxy_authenticator(inner.proxy_authenticator.clone())
            .protocols(inner.config.protocols.iter().copied())
            .connection_specs(inner.config.connection_specs.iter().cloned())
            .proxy_selector(inner.proxy_selector.clone());

        if let Some(proxy) = &inner.proxy {
            builder = builder.proxy(proxy.clone());
        }

        if secure {
            let tls = inner.tls.clone().ok_or_else(|| {
                Error::InvalidAddress(format!("TLS is not configured for {uri}"))
            })?;
            builder = builder.tls(tls);
        }

        builder.build()
    }

    /// A new call to `address`.
    pub fn new_call(&self, address: &Address) -> Arc<Call> {
        Arc::new(Call::new(address.host()))
    }
}

impl<C> Client<C>
where
    C: Connector,
{
    /// Run `call` on this thread: connect to `address` and hand the connection to
    /// `exchange`.
    ///
    /// The call counts towards the dispatcher's running calls until `exchange`
    /// returns. Synchronous calls are never held back by the dispatcher's limits.
    #[tracing::instrument(skip_all, level = "debug", fields(call = call.id(), host = %address.host()))]
    pub fn execute<T, F>(&self, call: &Arc<Call>, address: &Address, exchange: F) -> Result<T, Error>
    where
        F: FnOnce(&Call, Established<C::Connection>) -> T,
    {
        let dispatcher = &self.inner.dispatcher;
        dispatcher.executed(call.clone());
        let call: &Call = call;
        let _finished = Finished { dispatcher, call };

        let established = connect::connect(address, &self.inner.routes, &self.inner.connector, call)?;
        Ok(exchange(call, established))
    }
}

impl<C> Client<C>
where
    C: Connector + 'static,
    C::Connection: Send,
{
    /// Schedule `call` on the dispatcher. Once admitted it connects to `address` and
    /// hands the outcome to `callback` on an executor thread.
    ///
    /// A call cancelled while queued never runs, and `callback` is never invoked.
    pub fn enqueue<F>(&self, call: Arc<Call>, address: Address, callback: F)
    where
        F: FnOnce(&Call, Result<Established<C::Connection>, Error>) + Send + 'static,
    {
        let client = self.clone();
        self.inner.dispatcher.enqueue(call, move |call| {
            let outcome = connect::connect(
                &address,
                &client.inner.routes,
                &client.inner.connector,
                call,
            );
            callback(call, outcome);
        });
    }
}

/// Finishes a synchronous call, even when connecting or the exchange panics.
struct Finished<'a> {
    dispatcher: &'a Dispatcher,
    call: &'a Call,
}

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.dispatcher.finished(self.call);
    }
}
