use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

/// What a socket is used for. Pinned by the first role-specific operation
/// and immutable until [`TcpSocket::close`] resets it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Role {
    Unknown = 0,
    Client = 1,
    Server = 2,
}

/// Thin façade over one TCP socket: address resolution, the blocking
/// syscalls the workers run, and the client/server role check.
///
/// The underlying handle is shared, so a concurrent `close` shuts the
/// socket down under a blocked `recv`/`send` instead of pulling the fd out
/// from beneath it.
pub struct TcpSocket {
    inner: Mutex<Inner>,
    role: AtomicU8,
}

struct Inner {
    handle: Option<Arc<Socket>>,
    host: String,
    port: u16,
}

impl TcpSocket {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                handle: None,
                host: String::new(),
                port: 0,
            }),
            role: AtomicU8::new(Role::Unknown as u8),
        }
    }

    pub(crate) fn from_parts(socket: Socket, host: String, port: u16, role: Role) -> Self {
        Self {
            inner: Mutex::new(Inner {
                handle: Some(Arc::new(socket)),
                host,
                port,
            }),
            role: AtomicU8::new(role as u8),
        }
    }

    //
    // client operations
    //

    /// Establish a connection. With a timeout the connect runs in
    /// non-blocking mode against a single-fd writability poll; the socket
    /// is put back into blocking mode afterwards since every later syscall
    /// on it is blocking.
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        self.check_or_set_role(Role::Client)?;
        let addr = resolve(host, port)?;

        let socket = new_stream_socket(host)?;
        match timeout {
            Some(timeout) => {
                socket.connect_timeout(&addr, timeout).map_err(|e| {
                    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
                        Error::Timeout
                    } else {
                        Error::syscall("connect", e)
                    }
                })?;
                socket
                    .set_nonblocking(false)
                    .map_err(|e| Error::syscall("ioctl", e))?;
            }
            None => socket.connect(&addr).map_err(|e| Error::syscall("connect", e))?,
        }

        let mut inner = self.inner.lock();
        inner.handle = Some(Arc::new(socket));
        inner.host = host.to_owned();
        inner.port = port;
        Ok(())
    }

    /// Read up to `size_to_read` bytes. Zero bytes means the remote end
    /// closed the connection.
    pub fn recv(&self, size_to_read: usize) -> Result<Vec<u8>> {
        self.check_or_set_role(Role::Client)?;
        let handle = self.handle()?;

        let mut buf = vec![MaybeUninit::<u8>::uninit(); size_to_read];
        let read = handle.recv(&mut buf).map_err(|e| Error::syscall("recv", e))?;
        if read == 0 {
            return Err(Error::PeerClosed);
        }

        Ok(unsafe { slice_assume_init(&buf[..read]) }.to_vec())
    }

    /// Write `data`, returning how many bytes the kernel took.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.check_or_set_role(Role::Client)?;
        self.handle()?
            .send(data)
            .map_err(|e| Error::syscall("send", e))
    }

    //
    // server operations
    //

    pub fn bind(&self, host: &str, port: u16) -> Result<()> {
        self.check_or_set_role(Role::Server)?;
        let addr = resolve(host, port)?;

        let socket = new_stream_socket(host)?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::syscall("setsockopt", e))?;
        socket.bind(&addr).map_err(|e| Error::syscall("bind", e))?;

        let mut inner = self.inner.lock();
        inner.handle = Some(Arc::new(socket));
        inner.host = host.to_owned();
        inner.port = port;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.check_or_set_role(Role::Server)?;
        self.handle()?
            .listen(backlog)
            .map_err(|e| Error::syscall("listen", e))
    }

    /// Accept one pending connection; the returned socket already carries
    /// the [`Role::Client`] role and the peer address (IPv6 peers are
    /// reported in square brackets).
    pub fn accept(&self) -> Result<TcpSocket> {
        self.check_or_set_role(Role::Server)?;
        let handle = self.handle()?;

        let (socket, addr) = handle.accept().map_err(|e| Error::syscall("accept", e))?;
        let (host, port) = match addr.as_socket() {
            Some(SocketAddr::V6(v6)) => (format!("[{}]", v6.ip()), v6.port()),
            Some(SocketAddr::V4(v4)) => (v4.ip().to_string(), v4.port()),
            None => (String::new(), 0),
        };

        Ok(TcpSocket::from_parts(socket, host, port, Role::Client))
    }

    //
    // general operations
    //

    /// Shut the socket down and forget it. Any thread blocked in a
    /// syscall on this socket gets an error; the role resets to
    /// [`Role::Unknown`] so the handle can be reused.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.handle.take() {
            debug!("close socket {}", handle.as_raw_fd());
            let _ = handle.shutdown(std::net::Shutdown::Both);
        }
        self.role.store(Role::Unknown as u8, Ordering::Release);
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.lock().handle.as_ref().map(|h| h.as_raw_fd())
    }

    pub fn host(&self) -> String {
        self.inner.lock().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.lock().port
    }

    pub fn role(&self) -> Role {
        match self.role.load(Ordering::Acquire) {
            1 => Role::Client,
            2 => Role::Server,
            _ => Role::Unknown,
        }
    }

    /// The host string is taken as IPv6 iff it contains a colon, matching
    /// how `connect`/`bind` resolve it.
    pub fn is_ipv6(&self) -> bool {
        self.inner.lock().host.contains(':')
    }

    fn handle(&self) -> Result<Arc<Socket>> {
        self.inner
            .lock()
            .handle
            .clone()
            .ok_or(Error::InvalidOperation("socket is not open"))
    }

    fn check_or_set_role(&self, role: Role) -> Result<()> {
        match self.role.compare_exchange(
            Role::Unknown as u8,
            role as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == role as u8 => Ok(()),
            Err(_) => Err(Error::InvalidOperation(
                "operation does not match the socket role",
            )),
        }
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TcpSocket {
    fn eq(&self, other: &Self) -> bool {
        self.raw_fd() == other.raw_fd() && self.role.load(Ordering::Relaxed) == other.role.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TcpSocket")
            .field("fd", &inner.handle.as_ref().map(|h| h.as_raw_fd()))
            .field("host", &inner.host)
            .field("port", &inner.port)
            .field("role", &self.role())
            .finish()
    }
}

fn new_stream_socket(host: &str) -> Result<Socket> {
    let domain = if host.contains(':') {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| Error::syscall("socket", e))
}

/// Resolve a host string. A host containing `:` is parsed verbatim as an
/// IPv6 address; anything else goes through DNS and the first IPv4 result
/// wins.
fn resolve(host: &str, port: u16) -> Result<SockAddr> {
    if host.contains(':') {
        let ip: Ipv6Addr = host.parse().map_err(|e| {
            Error::syscall("inet_pton", io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;
        return Ok(SockAddr::from(SocketAddr::V6(SocketAddrV6::new(
            ip, port, 0, 0,
        ))));
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::syscall("getaddrinfo", e))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| {
            Error::syscall(
                "getaddrinfo",
                io::Error::new(io::ErrorKind::NotFound, "host has no IPv4 address"),
            )
        })?;
    Ok(SockAddr::from(addr))
}

// TODO: use MaybeUninit::slice_assume_init_ref once stable
unsafe fn slice_assume_init(slice: &[MaybeUninit<u8>]) -> &[u8] {
    &*(slice as *const [MaybeUninit<u8>] as *const [u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_pinned_by_first_operation() {
        let socket = TcpSocket::new();
        assert_eq!(socket.role(), Role::Unknown);

        socket.bind("127.0.0.1", 0).unwrap();
        assert_eq!(socket.role(), Role::Server);

        // client operations must now be rejected
        assert!(matches!(
            socket.recv(16),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            socket.send(b"nope"),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn close_resets_role() {
        let socket = TcpSocket::new();
        socket.bind("127.0.0.1", 0).unwrap();
        socket.close();
        assert_eq!(socket.role(), Role::Unknown);
        assert_eq!(socket.raw_fd(), None);
    }

    #[test]
    fn ipv6_detection_follows_colon_heuristic() {
        let raw = || Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();

        let socket = TcpSocket::from_parts(raw(), "[2001:db8::1]".into(), 4242, Role::Client);
        assert!(socket.is_ipv6());

        let socket = TcpSocket::from_parts(raw(), "127.0.0.1".into(), 4242, Role::Client);
        assert!(!socket.is_ipv6());
    }

    #[test]
    fn invalid_host_fails_synchronously() {
        let socket = TcpSocket::new();
        assert!(socket.connect("invalid url", 1234, None).is_err());
    }

    #[test]
    fn recv_without_handle_is_invalid() {
        let socket = TcpSocket::new();
        assert!(matches!(
            socket.recv(16),
            Err(Error::InvalidOperation(_))
        ));
    }
}
