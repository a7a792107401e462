use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use http::Uri;

use super::Connector;
use crate::{
    dns::{ip_literal, DnsCache, Resolve},
    pool::Poolable,
    transfer::uri_port,
    ResolveError, Result,
};

#[derive(Clone, Copy, Debug)]
pub struct TcpConnector {
    addr: SocketAddr,
    pub no_delay: bool,
    pub connect_timeout: Option<Duration>,
}

impl TcpConnector {
    #[inline]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            no_delay: true,
            connect_timeout: None,
        }
    }

    /// Build a connector for the authority of `uri`, resolving the host
    /// through `dns`.
    pub fn from_uri<R: Resolve>(uri: &Uri, dns: &DnsCache<R>) -> Result<Self> {
        let host = uri.host().ok_or(ResolveError::NoAuthority)?;
        let port = uri_port(uri);
        let ip = match ip_literal(host) {
            Some(ip) => ip,
            None => dns.first(host)?,
        };
        Ok(Self::new(SocketAddr::new(ip, port)))
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn dial(&self) -> io::Result<TcpStream> {
        let io = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&self.addr, timeout)?,
            None => TcpStream::connect(self.addr)?,
        };
        if self.no_delay {
            // we will ignore the set nodelay error
            let _ = io.set_nodelay(true);
        }
        Ok(io)
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;
    type Error = io::Error;

    #[inline]
    fn connect(&self) -> io::Result<TcpConnection> {
        let stream = self.dial()?;
        Ok(TcpConnection {
            stream: Some(stream),
            connector: *self,
        })
    }
}

/// A TCP stream that remembers how to dial itself again.
#[derive(Debug)]
pub struct TcpConnection {
    stream: Option<TcpStream>,
    connector: TcpConnector,
}

impl TcpConnection {
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.connector.addr
    }

    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Shut the socket down; the connection reports itself disconnected
    /// until the next successful `reconnect`.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

// A readable socket with zero bytes pending means the peer hung up.
fn peer_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut buf = [0u8; 1];
    let alive = match stream.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && alive
}

impl Poolable for TcpConnection {
    fn is_connected(&self) -> bool {
        self.stream.as_ref().map(peer_alive).unwrap_or(false)
    }

    fn reconnect(&mut self) -> bool {
        self.close();
        match self.connector.dial() {
            Ok(stream) => {
                self.stream = Some(stream);
                true
            }
            Err(_e) => {
                #[cfg(feature = "logging")]
                tracing::debug!("reconnect to {} failed: {}", self.connector.addr, _e);
                false
            }
        }
    }
}

impl Read for TcpConnection {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl Write for TcpConnection {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}
