use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::net::socket::TcpSocket;
use crate::reactor::{default_reactor, Reactor};

/// Outcome of one [`TcpClient::async_read`] request.
pub struct ReadResult {
    pub success: bool,
    /// Bytes actually received; empty on failure.
    pub buffer: Vec<u8>,
}

/// Outcome of one [`TcpClient::async_write`] request.
pub struct WriteResult {
    pub success: bool,
    /// How many bytes the kernel accepted; zero on failure.
    pub bytes_written: usize,
}

pub struct ReadRequest {
    pub size_to_read: usize,
    /// Completion callback; `None` fires the read without reporting back.
    pub on_complete: Option<Box<dyn FnOnce(ReadResult) + Send + 'static>>,
}

pub struct WriteRequest {
    pub buffer: Vec<u8>,
    pub on_complete: Option<Box<dyn FnOnce(WriteResult) + Send + 'static>>,
}

type DisconnectionHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Connection-oriented façade over one reactor-tracked socket.
///
/// Cloning is cheap and clones refer to the same connection. Reads and
/// writes are queued per direction and completed in submission order by
/// the reactor's workers; the two directions are independent.
#[derive(Clone)]
pub struct TcpClient {
    core: Arc<ClientCore>,
}

pub(crate) struct ClientCore {
    reactor: Arc<Reactor>,
    socket: TcpSocket,
    // fd snapshot taken when the socket is registered; kept after close so
    // disconnect can still untrack
    fd: AtomicI32,
    connected: AtomicBool,
    read_requests: Mutex<VecDeque<ReadRequest>>,
    write_requests: Mutex<VecDeque<WriteRequest>>,
    disconnection_handler: Mutex<Option<DisconnectionHandler>>,
}

impl TcpClient {
    /// A disconnected client bound to the process-wide default reactor.
    pub fn new() -> Result<Self> {
        Ok(Self::with_reactor(default_reactor()?))
    }

    pub fn with_reactor(reactor: Arc<Reactor>) -> Self {
        Self {
            core: Arc::new(ClientCore {
                reactor,
                socket: TcpSocket::new(),
                fd: AtomicI32::new(-1),
                connected: AtomicBool::new(false),
                read_requests: Mutex::new(VecDeque::new()),
                write_requests: Mutex::new(VecDeque::new()),
                disconnection_handler: Mutex::new(None),
            }),
        }
    }

    /// Adopt an already-connected socket (the server accept path): no
    /// connect, straight to registered + connected.
    pub(crate) fn from_socket(reactor: Arc<Reactor>, socket: TcpSocket) -> Result<Self> {
        let fd = socket
            .raw_fd()
            .ok_or(Error::InvalidOperation("accepted socket is closed"))?;

        let client = Self {
            core: Arc::new(ClientCore {
                reactor,
                socket,
                fd: AtomicI32::new(fd),
                connected: AtomicBool::new(true),
                read_requests: Mutex::new(VecDeque::new()),
                write_requests: Mutex::new(VecDeque::new()),
                disconnection_handler: Mutex::new(None),
            }),
        };
        client.core.reactor.track(fd, None, None);
        Ok(client)
    }

    /// Connect to `host:port`, optionally bounded by `timeout`, and
    /// register the socket with the reactor.
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidOperation("client is already connected"));
        }

        if let Err(e) = self.core.socket.connect(host, port, timeout) {
            self.core.socket.close();
            return Err(e);
        }

        let fd = self
            .core
            .socket
            .raw_fd()
            .ok_or(Error::InvalidOperation("socket closed during connect"))?;
        self.core.fd.store(fd, Ordering::Release);
        self.core.reactor.track(fd, None, None);
        self.core.connected.store(true, Ordering::Release);

        debug!("client connected to {}:{}", host, port);
        Ok(())
    }

    /// Tear the connection down. Pending queued requests are dropped
    /// without firing their callbacks; with `wait_for_removal` the call
    /// blocks until no worker still runs a callback for this socket.
    ///
    /// A disconnect of an already-disconnected client is a no-op.
    pub fn disconnect(&self, wait_for_removal: bool) {
        if self.core.teardown(wait_for_removal) {
            debug!("client disconnected");
        }
    }

    /// Queue a read of `request.size_to_read` bytes.
    pub fn async_read(&self, request: ReadRequest) -> Result<()> {
        let mut queue = self.core.read_requests.lock();
        if !self.is_connected() {
            return Err(Error::InvalidOperation("client is disconnected"));
        }

        let weak = Arc::downgrade(&self.core);
        self.core.reactor.set_rd_callback(
            self.core.fd.load(Ordering::Acquire),
            Some(Arc::new(move |fd| {
                if let Some(core) = weak.upgrade() {
                    core.on_read_available(fd);
                }
            })),
        );
        queue.push_back(request);
        Ok(())
    }

    /// Queue a write of `request.buffer`.
    pub fn async_write(&self, request: WriteRequest) -> Result<()> {
        let mut queue = self.core.write_requests.lock();
        if !self.is_connected() {
            return Err(Error::InvalidOperation("client is disconnected"));
        }

        let weak = Arc::downgrade(&self.core);
        self.core.reactor.set_wr_callback(
            self.core.fd.load(Ordering::Acquire),
            Some(Arc::new(move |fd| {
                if let Some(core) = weak.upgrade() {
                    core.on_write_available(fd);
                }
            })),
        );
        queue.push_back(request);
        Ok(())
    }

    /// Install the hook fired once per connection loss, after internal
    /// teardown. It must not call blocking client methods on this client;
    /// scheduling a reconnect from another thread is fine.
    pub fn set_on_disconnection_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.core.disconnection_handler.lock() = Some(Arc::new(handler));
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    pub fn host(&self) -> String {
        self.core.socket.host()
    }

    pub fn port(&self) -> u16 {
        self.core.socket.port()
    }

    pub fn socket(&self) -> &TcpSocket {
        &self.core.socket
    }

    pub fn reactor(&self) -> Arc<Reactor> {
        self.core.reactor.clone()
    }

    pub(crate) fn core_weak(&self) -> Weak<ClientCore> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn core_ptr(&self) -> *const ClientCore {
        Arc::as_ptr(&self.core)
    }
}

impl PartialEq for TcpClient {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl ClientCore {
    /// Perform the DISCONNECTED transition. Returns whether this call won
    /// the race; only the winner may fire the disconnection handler.
    fn teardown(&self, wait_for_removal: bool) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.read_requests.lock().clear();
        self.write_requests.lock().clear();

        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            self.reactor.untrack(fd);
            if wait_for_removal {
                self.reactor.wait_for_removal(fd);
            }
        }

        self.socket.close();
        true
    }

    fn call_disconnection_handler(&self) {
        let handler = self.disconnection_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn on_read_available(&self, _fd: RawFd) {
        trace!("read available");

        let Some((result, on_complete)) = self.process_read() else {
            return;
        };

        let transitioned = if !result.success {
            warn!("read operation failure");
            self.teardown(false)
        } else {
            false
        };

        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
        if transitioned {
            self.call_disconnection_handler();
        }
    }

    fn on_write_available(&self, _fd: RawFd) {
        trace!("write available");

        let Some((result, on_complete)) = self.process_write() else {
            return;
        };

        let transitioned = if !result.success {
            warn!("write operation failure");
            self.teardown(false)
        } else {
            false
        };

        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
        if transitioned {
            self.call_disconnection_handler();
        }
    }

    /// Pop and execute the head read request. Returns `None` on a spurious
    /// wake-up with an empty queue; interest is withdrawn either way once
    /// there is nothing left to read.
    #[allow(clippy::type_complexity)]
    fn process_read(
        &self,
    ) -> Option<(ReadResult, Option<Box<dyn FnOnce(ReadResult) + Send + 'static>>)> {
        let mut queue = self.read_requests.lock();
        let fd = self.fd.load(Ordering::Acquire);

        let request = match queue.pop_front() {
            Some(request) => request,
            None => {
                self.reactor.set_rd_callback(fd, None);
                return None;
            }
        };

        let result = match self.socket.recv(request.size_to_read) {
            Ok(buffer) => ReadResult {
                success: true,
                buffer,
            },
            Err(_) => ReadResult {
                success: false,
                buffer: Vec::new(),
            },
        };

        if queue.is_empty() {
            self.reactor.set_rd_callback(fd, None);
        }

        Some((result, request.on_complete))
    }

    #[allow(clippy::type_complexity)]
    fn process_write(
        &self,
    ) -> Option<(WriteResult, Option<Box<dyn FnOnce(WriteResult) + Send + 'static>>)> {
        let mut queue = self.write_requests.lock();
        let fd = self.fd.load(Ordering::Acquire);

        let request = match queue.pop_front() {
            Some(request) => request,
            None => {
                self.reactor.set_wr_callback(fd, None);
                return None;
            }
        };

        let result = match self.socket.send(&request.buffer) {
            Ok(bytes_written) => WriteResult {
                success: true,
                bytes_written,
            },
            Err(_) => WriteResult {
                success: false,
                bytes_written: 0,
            },
        };

        if queue.is_empty() {
            self.reactor.set_wr_callback(fd, None);
        }

        Some((result, request.on_complete))
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.teardown(true);
    }
}
