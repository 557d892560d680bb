use std::fmt;
use std::sync::Arc;

use super::{Client, ClientInner, Config};
use crate::address::{no_authenticator, Authenticator};
use crate::connect::{SocketFactory, TcpConnector, TcpSocketFactory};
use crate::dispatcher::{Dispatcher, Executor};
use crate::dns::Dns;
use crate::route::database::RouteDatabase;
use crate::route::proxy::{Proxy, ProxySelector};
use crate::tls::TlsPolicy;
use crate::{DebugLiteral, Error};

type IdleCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A builder for a [`Client`].
///
/// Capabilities which aren't set use the process-wide defaults: the system resolver,
/// no proxy and no proxy credentials. Without a TLS policy the client can only reach
/// `http` URIs.
pub struct Builder<C = TcpConnector> {
    config: Config,
    dns: Option<Arc<dyn Dns>>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    proxy: Option<Proxy>,
    proxy_selector: Option<Arc<dyn ProxySelector>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    tls: Option<TlsPolicy>,
    executor: Option<Arc<dyn Executor>>,
    idle_callback: Option<IdleCallback>,
    connector: C,
}

impl Builder {
    /// Create a builder from `config`, connecting with a [`TcpConnector`].
    pub fn new(config: Config) -> Self {
        let connector = TcpConnector::new(config.tcp.clone());
        Self {
            config,
            dns: None,
            socket_factory: None,
            proxy: None,
            proxy_selector: None,
            proxy_authenticator: None,
            tls: None,
            executor: None,
            idle_callback: None,
            connector,
        }
    }

    /// Speak TLS with rustls, trusting the roots configured in `factory`.
    ///
    /// This sets the TLS policy and configures the [`TcpConnector`] to perform
    /// handshakes with the same factory.
    #[cfg(feature = "tls")]
    pub fn with_rustls(mut self, factory: Arc<crate::tls::rustls::RustlsSocketFactory>) -> Self {
        self.tls = Some(TlsPolicy::new(factory.clone()));
        self.connector = self.connector.with_tls(factory);
        self
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<C> Builder<C> {
    /// Resolve host names with `dns`.
    pub fn with_dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Send every call through `proxy`, ignoring the proxy selector.
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Choose proxies per URI with `selector`.
    pub fn with_proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = Some(selector);
        self
    }

    /// Answer proxy authentication challenges with `authenticator`.
    pub fn with_proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = Some(authenticator);
        self
    }

    /// Create sockets with `factory` instead of applying the configured TCP options.
    pub fn with_socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    /// Reach `https` URIs with `policy`.
    pub fn with_tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = Some(policy);
        self
    }

    /// Run asynchronous calls on `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run `callback` each time the client's dispatcher becomes idle.
    pub fn with_idle_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.idle_callback = Some(Arc::new(callback));
        self
    }

    /// Open connections with `connector`.
    pub fn with_connector<C2>(self, connector: C2) -> Builder<C2> {
        Builder {
            config: self.config,
            dns: self.dns,
            socket_factory: self.socket_factory,
            proxy: self.proxy,
            proxy_selector: self.proxy_selector,
            proxy_authenticator: self.proxy_authenticator,
            tls: self.tls,
            executor: self.executor,
            idle_callback: self.idle_callback,
            connector,
        }
    }

    /// The configuration being built.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable access to the configuration being built.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Build the client.
    ///
    /// Fails with [`Error::InvalidArgument`] if the configured limits are below one.
    pub fn build(self) -> Result<Client<C>, Error> {
        let dispatcher = match self.executor {
            Some(executor) => Dispatcher::with_executor(executor),
            None => Dispatcher::new(),
        };
        dispatcher.set_max_requests(self.config.max_requests)?;
        dispatcher.set_max_requests_per_host(self.config.max_requests_per_host)?;
        if let Some(callback) = self.idle_callback {
            dispatcher.set_idle_callback(move || callback());
        }

        let socket_factory = self
            .socket_factory
            .unwrap_or_else(|| Arc::new(TcpSocketFactory::new(self.config.tcp.clone())));

        Ok(Client {
            inner: Arc::new(ClientInner {
                dns: self.dns.unwrap_or_else(crate::dns::system),
                socket_factory,
                proxy: self.proxy,
                proxy_selector: self
                    .proxy_selector
                    .unwrap_or_else(crate::route::proxy::system),
                proxy_authenticator: self.proxy_authenticator.unwrap_or_else(no_authenticator),
                tls: self.tls,
                dispatcher,
                routes: Arc::new(RouteDatabase::new()),
                connector: self.connector,
                config: self.config,
            }),
        })
    }
}

impl<C: fmt::Debug> fmt::Debug for Builder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("proxy", &self.proxy)
            .field("tls", &DebugLiteral(self.tls.is_some()))
            .field("executor", &self.executor)
            .field("connector", &self.connector)
            .finish()
    }
}
