//! Byte-stream transport of the bridge: endpoints, framing and the accept/serve loop.

pub mod frame;
mod server;

pub use frame::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_SIZE};
pub use server::{TransportCloser, TransportOptions, TransportServer};

use std::fmt::{Display, Formatter};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("empty endpoint")]
    Empty,
    #[error("invalid unix socket path in `{0}`")]
    InvalidPath(String),
    #[error("invalid tcp address `{0}`, expected host:port")]
    InvalidAddress(String),
}

/// Listening endpoint: `host:port`, `tcp:host:port` or `unix:/path/to/socket`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(EndpointError::InvalidPath(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            _ => Err(EndpointError::InvalidAddress(s.to_string())),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub(crate) fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str())?)),
            Endpoint::Unix(path) => {
                // a socket file left by a previous run makes bind fail with EADDRINUSE
                if path.exists() && UnixStream::connect(path).is_err() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    /// Actually bound endpoint (resolves port 0).
    pub(crate) fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(l) => Ok(Endpoint::Tcp(l.local_addr()?.to_string())),
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    pub(crate) fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                stream.set_nodelay(true)?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
            Listener::Unix(l, path) => {
                let (stream, _) = l.accept()?;
                Ok((Connection::Unix(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            _ = std::fs::remove_file(path);
        }
    }
}

/// Client connection of a transport endpoint.
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    /// Connect to an endpoint as a client.
    pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let addrs: Vec<SocketAddr> = addr
                    .to_socket_addrs()?
                    .map(|mut addr| {
                        if addr.ip().is_unspecified() {
                            addr.set_ip(match addr {
                                SocketAddr::V4(_) => [127, 0, 0, 1].into(),
                                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
                            });
                        }
                        addr
                    })
                    .collect();
                let stream = TcpStream::connect(&addrs[..])?;
                stream.set_nodelay(true)?;
                Ok(Connection::Tcp(stream))
            }
            Endpoint::Unix(path) => Ok(Connection::Unix(UnixStream::connect(path)?)),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Connection::Tcp(s) => Ok(Connection::Tcp(s.try_clone()?)),
            Connection::Unix(s) => Ok(Connection::Unix(s.try_clone()?)),
        }
    }

    /// Shut down both directions, unblocking any pending read.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.shutdown(Shutdown::Both),
            Connection::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.set_read_timeout(timeout),
            Connection::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            Connection::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            Connection::Unix(s) => s.flush(),
        }
    }
}
