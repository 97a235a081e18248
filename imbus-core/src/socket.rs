//! Socket plumbing: addresses, streams over Unix/TCP sockets, and the `SocketClient` contract
//! every peer scheduled by the multiplexer implements.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;

use crate::multiplexer::{ClientId, Dispatch};

/// sun_path is 108 bytes on Linux, 104 on macOS.
const MAX_SOCKET_PATH: usize = 104;

/// A byte stream whose blocking reads can be bounded.
pub trait TimedStream: Read + Write {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl TimedStream for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

impl TimedStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Where a server listens: `local:/run/user/1000/imbus` or `inet:127.0.0.1:7077`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Local(PathBuf),
    Inet { host: String, port: u16 },
}

/// Error parsing a socket address string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown address scheme in {0:?} (expected local: or inet:)")]
    UnknownScheme(String),
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("empty path in {0:?}")]
    EmptyPath(String),
}

impl FromStr for SocketAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("local:") {
            if path.is_empty() {
                return Err(AddressError::EmptyPath(s.to_string()));
            }
            return Ok(SocketAddress::Local(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("inet:") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            return Ok(SocketAddress::Inet {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            });
        }
        Err(AddressError::UnknownScheme(s.to_string()))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Local(p) => write!(f, "local:{}", p.display()),
            SocketAddress::Inet { host, port } if host.contains(':') => {
                write!(f, "inet:[{}]:{}", host, port)
            }
            SocketAddress::Inet { host, port } => write!(f, "inet:{}:{}", host, port),
        }
    }
}

impl SocketAddress {
    /// Connect, bounding the TCP connect by `timeout`.
    pub fn connect(&self, timeout: Duration) -> io::Result<SocketStream> {
        match self {
            SocketAddress::Local(path) => Ok(SocketStream::Unix(UnixStream::connect(path)?)),
            SocketAddress::Inet { host, port } => {
                let mut last = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            s.set_nodelay(true)?;
                            return Ok(SocketStream::Tcp(s));
                        }
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
        }
    }

    /// Bind a listener. A stale Unix socket nobody answers on is replaced and the new one is
    /// owner-only; a live socket or a non-socket file at the path is an error.
    pub fn bind(&self) -> io::Result<SocketListener> {
        match self {
            SocketAddress::Local(path) => {
                if path.as_os_str().len() >= MAX_SOCKET_PATH {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("socket path too long: {}", path.display()),
                    ));
                }
                remove_stale_socket(path)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                Ok(SocketListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            SocketAddress::Inet { host, port } => {
                Ok(SocketListener::Tcp(TcpListener::bind((host.as_str(), *port))?))
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    match UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("a server is already listening on {}", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => std::fs::remove_file(path),
        Err(e) => Err(e),
    }
}

/// A connected stream of either family.
#[derive(Debug)]
pub enum SocketStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl SocketStream {
    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            SocketStream::Unix(s) => s.set_nonblocking(on),
            SocketStream::Tcp(s) => s.set_nonblocking(on),
        }
    }

    pub fn try_clone(&self) -> io::Result<SocketStream> {
        Ok(match self {
            SocketStream::Unix(s) => SocketStream::Unix(s.try_clone()?),
            SocketStream::Tcp(s) => SocketStream::Tcp(s.try_clone()?),
        })
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketStream::Unix(s) => s.read(buf),
            SocketStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketStream::Unix(s) => s.write(buf),
            SocketStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SocketStream::Unix(s) => s.flush(),
            SocketStream::Tcp(s) => s.flush(),
        }
    }
}

impl TimedStream for SocketStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            SocketStream::Unix(s) => s.set_read_timeout(timeout),
            SocketStream::Tcp(s) => s.set_read_timeout(timeout),
        }
    }
}

impl AsRawFd for SocketStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SocketStream::Unix(s) => s.as_raw_fd(),
            SocketStream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// A bound listener of either family. The Unix socket file is removed on drop.
#[derive(Debug)]
pub enum SocketListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl SocketListener {
    pub fn accept(&self) -> io::Result<SocketStream> {
        match self {
            SocketListener::Unix { listener, .. } => Ok(SocketStream::Unix(listener.accept()?.0)),
            SocketListener::Tcp(l) => {
                let (s, _) = l.accept()?;
                s.set_nodelay(true)?;
                Ok(SocketStream::Tcp(s))
            }
        }
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            SocketListener::Unix { listener, .. } => listener.set_nonblocking(on),
            SocketListener::Tcp(l) => l.set_nonblocking(on),
        }
    }

    /// The address actually bound (resolves an `inet:` port of 0).
    pub fn local_address(&self) -> io::Result<SocketAddress> {
        match self {
            SocketListener::Unix { path, .. } => Ok(SocketAddress::Local(path.clone())),
            SocketListener::Tcp(l) => {
                let a = l.local_addr()?;
                Ok(SocketAddress::Inet {
                    host: a.ip().to_string(),
                    port: a.port(),
                })
            }
        }
    }
}

impl AsRawFd for SocketListener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SocketListener::Unix { listener, .. } => listener.as_raw_fd(),
            SocketListener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let SocketListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

bitflags! {
    /// Conditions a client is interested in, and the subset that fired on a wake-up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Events: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        /// The multiplexer was woken through its interrupter.
        const INTERRUPT = 1 << 3;
    }
}

/// What the multiplexer should do with a client after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

/// A peer scheduled by the [`EventMultiplexer`](crate::multiplexer::EventMultiplexer).
pub trait SocketClient {
    /// Descriptor to poll, or `None` for a pseudo client driven only by [`pending`](Self::pending)
    /// and interrupts.
    fn fd(&self) -> Option<RawFd>;

    /// Conditions to wait for. Re-read before every poll.
    fn interest(&self) -> Events;

    /// Asked once per loop iteration before polling. Non-empty means "dispatch me now".
    fn pending(&mut self) -> Events {
        Events::empty()
    }

    /// Handle fired events. Returning `Remove` drops the client after this call.
    fn handle(&mut self, events: Events, dispatch: &mut Dispatch) -> Disposition;

    /// Called once when the client joins the loop, with the id it was given.
    fn registered(&mut self, _id: ClientId) {}

    /// Label for logs.
    fn name(&self) -> &str {
        "client"
    }
}
