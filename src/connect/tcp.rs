//! Blocking TCP connections.
//!
//! This module contains the [`TcpConnector`], a [`Connector`] which dials routes with
//! blocking sockets, tunnels through HTTP proxies and (with the `tls` feature) performs
//! the TLS handshake. Sockets are created by a [`SocketFactory`]; the default
//! [`TcpSocketFactory`] applies a [`TcpConfig`].

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use socket2::{Domain, Socket, TcpKeepalive, Type};
use tracing::{trace, warn};

use super::tunnel;
use super::{ConnectError, Connector, TlsHandshake};
use crate::address::Protocol;
use crate::route::proxy::Proxy;
use crate::route::Route;

/// Creates unconnected TCP sockets.
pub trait SocketFactory: fmt::Debug + Send + Sync + 'static {
    /// Create a socket which will be connected to `addr`.
    fn create_socket(&self, addr: &SocketAddr) -> io::Result<Socket>;
}

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConfig {
    /// The timeout for connecting to a remote address.
    pub connect_timeout: Option<Duration>,

    /// The timeout for reads on a connected socket.
    pub read_timeout: Option<Duration>,

    /// The timeout for writes on a connected socket.
    pub write_timeout: Option<Duration>,

    /// The timeout for keep-alive connections.
    pub keep_alive_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// A [`SocketFactory`] which applies a [`TcpConfig`] to each socket.
///
/// Option failures other than binding the local address are logged and ignored.
#[derive(Debug, Clone, Default)]
pub struct TcpSocketFactory {
    config: TcpConfig,
}

impl TcpSocketFactory {
    /// Create a factory applying `config`.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// The configuration applied to new sockets.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl SocketFactory for TcpSocketFactory {
    fn create_socket(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(*addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        trace!("tcp socket opened");

        let _guard = tracing::trace_span!("socket_options").entered();
        let config = &self.config;

        if let Some(dur) = config.keep_alive_timeout {
            let conf = TcpKeepalive::new().with_time(dur);
            if let Err(e) = socket.set_tcp_keepalive(&conf) {
                warn!("tcp set_keepalive error: {}", e);
            }
        }

        bind_local_address(
            &socket,
            addr,
            &config.local_address_ipv4,
            &config.local_address_ipv6,
        )?;

        if config.nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                warn!("tcp set_nodelay error: {}", e);
            }
        }

        if config.reuse_address {
            if let Err(e) = socket.set_reuse_address(true) {
                warn!("tcp set_reuse_address error: {}", e);
            }
        }

        if let Some(size) = config.send_buffer_size {
            if let Err(e) = socket.set_send_buffer_size(size) {
                warn!("tcp set_buffer_size error: {}", e);
            }
        }

        if let Some(size) = config.recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                warn!("tcp set_recv_buffer_size error: {}", e);
            }
        }

        Ok(socket)
    }
}

/// The process-wide default [`TcpSocketFactory`].
pub fn system() -> Arc<dyn SocketFactory> {
    static SYSTEM: OnceLock<Arc<dyn SocketFactory>> = OnceLock::new();
    SYSTEM
        .get_or_init(|| Arc::new(TcpSocketFactory::default()))
        .clone()
}

fn bind_local_address(
    socket: &Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

/// An established connection.
#[non_exhaustive]
pub enum Connection {
    /// A plaintext TCP stream.
    Plain(TcpStream),

    /// A TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Connection {
    /// The underlying TCP stream.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.get_ref(),
        }
    }

    /// The remote address of the socket (which may be a proxy).
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// The application protocol negotiated with ALPN, if any.
    pub fn negotiated_protocol(&self) -> Option<Protocol> {
        match self {
            Connection::Plain(_) => None,
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream
                .conn
                .alpn_protocol()
                .and_then(|alpn| std::str::from_utf8(alpn).ok())
                .and_then(|alpn| alpn.parse().ok()),
        }
    }

    /// Is this a TLS connection?
    pub fn is_secure(&self) -> bool {
        !matches!(self, Connection::Plain(_))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_secure() { "tls" } else { "tcp" };
        f.debug_struct("Connection")
            .field("kind", &kind)
            .field("peer_addr", &self.peer_addr().ok())
            .finish()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.flush(),
        }
    }
}

/// A [`Connector`] using blocking sockets.
///
/// Sockets are created by each route's [`SocketFactory`]. HTTPS routes through HTTP
/// proxies are tunnelled with `CONNECT`. SOCKS proxies are not supported.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
    #[cfg(feature = "tls")]
    tls: Option<Arc<crate::tls::rustls::RustlsSocketFactory>>,
}

impl TcpConnector {
    /// Create a connector applying the timeouts in `config`.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Perform TLS handshakes with rustls, configured by `factory`.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, factory: Arc<crate::tls::rustls::RustlsSocketFactory>) -> Self {
        self.tls = Some(factory);
        self
    }

    /// The connector's configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Open a TCP connection to the route's endpoint.
    fn connect_socket(&self, route: &Route) -> Result<TcpStream, ConnectError> {
        if let Proxy::Socks(proxy) = route.proxy() {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("SOCKS proxy {proxy} is not supported"),
            )));
        }

        let addr = route.endpoint().socket_addr().ok_or_else(|| {
            ConnectError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not resolved", route.endpoint()),
            ))
        })?;

        let socket = route.address().socket_factory().create_socket(&addr)?;

        let span = tracing::trace_span!("tcp", remote.addr = %addr);
        let _guard = span.enter();
        match self.config.connect_timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout).map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
                    trace!(?timeout, "connection timed out");
                    io::Error::new(io::ErrorKind::TimedOut, e)
                } else {
                    e
                }
            })?,
            None => socket.connect(&addr.into())?,
        }

        let stream: TcpStream = socket.into();
        stream.set_read_timeout(self.config.read_timeout)?;
        stream.set_write_timeout(self.config.write_timeout)?;
        trace!("tcp connected");
        Ok(stream)
    }

    /// Open a TCP connection, tunnelling through the route's proxy when required.
    fn connect_tunnel(&self, route: &Route) -> Result<TcpStream, ConnectError> {
        let mut request = tunnel::request(route.address())?;
        let mut attempts = 0;

        while attempts < tunnel::MAX_TUNNEL_ATTEMPTS {
            let stream = self.connect_socket(route)?;
            match tunnel::establish(&stream, request, route, &mut attempts)? {
                None => return Ok(stream),
                Some(next) => {
                    trace!(attempts, "proxy closed the connection, retrying tunnel");
                    request = next;
                }
            }
        }

        Err(tunnel::too_many_attempts())
    }

    #[cfg(feature = "tls")]
    fn handshake(
        &self,
        route: &Route,
        stream: TcpStream,
        handshake: &TlsHandshake,
    ) -> Result<Connection, ConnectError> {
        let factory = self.tls.as_ref().ok_or_else(|| {
            ConnectError::Protocol("no TLS implementation is configured".into())
        })?;
        let address = route.address();
        let policy = address.tls().ok_or_else(|| {
            ConnectError::Protocol(format!("{} is not a secure address", address.host()))
        })?;

        let alpn = if handshake.spec().supports_tls_extensions() {
            address
                .protocols()
                .iter()
                .map(|protocol| protocol.alpn().to_vec())
                .collect()
        } else {
            Vec::new()
        };

        let config = factory.client_config(
            handshake.socket(),
            handshake.spec().supports_tls_extensions(),
            alpn,
        )?;
        let host = address.host().trim_start_matches('[').trim_end_matches(']');
        let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(|error| ConnectError::Protocol(format!("invalid server name: {error}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)?;
        let mut stream = stream;

        let _span = tracing::trace_span!("tls", host = %address.host()).entered();
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(crate::tls::rustls::io_error)?;
        }

        let certificates: Vec<Vec<u8>> = conn
            .peer_certificates()
            .unwrap_or_default()
            .iter()
            .map(|certificate| certificate.as_ref().to_vec())
            .collect();

        if !policy
            .hostname_verifier()
            .verify(address.host(), &certificates)
        {
            return Err(ConnectError::PeerUnverified(
                format!("hostname {} not verified", address.host()).into(),
            ));
        }

        policy
            .certificate_pinner()
            .check(address.host(), &certificates)
            .map_err(ConnectError::PeerUnverified)?;

        trace!(
            version = ?conn.protocol_version(),
            alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
            "tls connected"
        );
        Ok(Connection::Tls(Box::new(rustls::StreamOwned::new(
            conn, stream,
        ))))
    }

    #[cfg(not(feature = "tls"))]
    fn handshake(
        &self,
        route: &Route,
        _stream: TcpStream,
        _handshake: &TlsHandshake,
    ) -> Result<Connection, ConnectError> {
        Err(ConnectError::Protocol(format!(
            "connecting to {} requires TLS, which is not enabled",
            route.address().host()
        )))
    }
}

impl Connector for TcpConnector {
    type Connection = Connection;

    fn connect(
        &self,
        route: &Route,
        tls: Option<&TlsHandshake>,
    ) -> Result<Connection, ConnectError> {
        let stream = if route.requires_tunnel() {
            self.connect_tunnel(route)?
        } else {
            self.connect_socket(route)?
        };

        match tls {
            Some(handshake) => self.handshake(route, stream, handshake),
            None => Ok(Connection::Plain(stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::address::tests::builder;
    use crate::route::Endpoint;

    #[test]
    fn socket_factory_applies_options() {
        let factory = TcpSocketFactory::new(TcpConfig {
            local_address_ipv4: Some(Ipv4Addr::LOCALHOST),
            send_buffer_size: Some(64 * 1024),
            ..Default::default()
        });

        let socket = factory
            .create_socket(&SocketAddr::from((Ipv4Addr::LOCALHOST, 80)))
            .unwrap();
        assert!(socket.nodelay().unwrap());
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn connects_plain_tcp() {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let address = builder("localhost", addr.port()).build().unwrap();
        let route = Route::new(address, Proxy::Direct, Endpoint::Resolved(addr)).unwrap();

        let connector = TcpConnector::default();
        let connection = connector.connect(&route, None).unwrap();
        assert!(!connection.is_secure());
        assert_eq!(connection.peer_addr().unwrap(), addr);
        assert_eq!(connection.negotiated_protocol(), None);

        let (accepted, _) = listener.accept().unwrap();
        assert_eq!(
            accepted.peer_addr().unwrap(),
            connection.tcp().local_addr().unwrap()
        );
    }

    #[test]
    fn refused_connections_are_io_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let address = builder("localhost", addr.port()).build().unwrap();
        let route = Route::new(address, Proxy::Direct, Endpoint::Resolved(addr)).unwrap();

        let error = TcpConnector::default().connect(&route, None).unwrap_err();
        assert!(matches!(error, ConnectError::Io(_)));
    }

    #[test]
    fn socks_is_unsupported() {
        let address = builder("example.com", 80).build().unwrap();
        let route = Route::new(
            address,
            Proxy::socks("socks.example", 1080),
            Endpoint::Unresolved {
                host: "example.com".into(),
                port: 80,
            },
        )
        .unwrap();

        let error = TcpConnector::default().connect(&route, None).unwrap_err();
        match error {
            ConnectError::Io(error) => assert_eq!(error.kind(), io::ErrorKind::Unsupported),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
