use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::net::client::{ClientCore, TcpClient};
use crate::net::socket::TcpSocket;
use crate::reactor::{default_reactor, Reactor};
use crate::DEFAULT_LISTEN_BACKLOG;

type NewConnectionHandler = Arc<dyn Fn(&TcpClient) -> bool + Send + Sync + 'static>;

/// Listening socket plus the accepted clients it still owns.
///
/// The `on_new_connection` hook decides ownership per client: returning
/// `true` transfers the client to the caller (clone the handle), `false`
/// leaves it with the server, which reaps it on disconnection.
pub struct TcpServer {
    core: Arc<ServerCore>,
}

struct ServerCore {
    reactor: Arc<Reactor>,
    socket: TcpSocket,
    fd: AtomicI32,
    running: AtomicBool,
    clients: Mutex<Vec<TcpClient>>,
    on_new_connection: Mutex<Option<NewConnectionHandler>>,
}

impl TcpServer {
    /// A stopped server bound to the process-wide default reactor.
    pub fn new() -> Result<Self> {
        Ok(Self::with_reactor(default_reactor()?))
    }

    pub fn with_reactor(reactor: Arc<Reactor>) -> Self {
        Self {
            core: Arc::new(ServerCore {
                reactor,
                socket: TcpSocket::new(),
                fd: AtomicI32::new(-1),
                running: AtomicBool::new(false),
                clients: Mutex::new(Vec::new()),
                on_new_connection: Mutex::new(None),
            }),
        }
    }

    /// Bind + listen on `host:port` and start accepting.
    pub fn start<F>(&self, host: &str, port: u16, on_new_connection: F) -> Result<()>
    where
        F: Fn(&TcpClient) -> bool + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(Error::InvalidOperation("server is already running"));
        }

        self.core.socket.bind(host, port)?;
        self.core.socket.listen(DEFAULT_LISTEN_BACKLOG)?;

        let fd = self
            .core
            .socket
            .raw_fd()
            .ok_or(Error::InvalidOperation("socket closed during start"))?;
        self.core.fd.store(fd, Ordering::Release);
        *self.core.on_new_connection.lock() = Some(Arc::new(on_new_connection));

        self.core.reactor.track(fd, None, None);
        let weak = Arc::downgrade(&self.core);
        self.core.reactor.set_rd_callback(
            fd,
            Some(Arc::new(move |fd| {
                if let Some(core) = weak.upgrade() {
                    ServerCore::on_read_available(&core, fd);
                }
            })),
        );

        self.core.running.store(true, Ordering::Release);
        debug!("server listening on {}:{}", host, port);
        Ok(())
    }

    /// Stop accepting, close the listening socket, then disconnect every
    /// owned client. `wait_for_removal` blocks until the listening socket
    /// left the reactor; `recursive_wait_for_removal` extends that to the
    /// owned clients.
    pub fn stop(&self, wait_for_removal: bool, recursive_wait_for_removal: bool) {
        if self.core.teardown(wait_for_removal, recursive_wait_for_removal) {
            debug!("server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// The clients currently owned by the server.
    pub fn clients(&self) -> Vec<TcpClient> {
        self.core.clients.lock().clone()
    }

    pub fn socket(&self) -> &TcpSocket {
        &self.core.socket
    }

    pub fn reactor(&self) -> Arc<Reactor> {
        self.core.reactor.clone()
    }
}

impl ServerCore {
    fn on_read_available(this: &Arc<Self>, _fd: RawFd) {
        debug!("server received new connection");
        if let Err(e) = Self::accept_one(this) {
            warn!("accept operation failure: {}", e);
            this.teardown(false, false);
        }
    }

    fn accept_one(this: &Arc<Self>) -> Result<()> {
        let socket = this.socket.accept()?;
        let client = TcpClient::from_socket(this.reactor.clone(), socket)?;

        let hook = this.on_new_connection.lock().clone();
        let handled = match hook {
            Some(hook) => hook(&client),
            None => false,
        };

        if handled {
            debug!("connection handled by the on_new_connection hook");
            return Ok(());
        }

        // the server keeps the client and reaps it when it disconnects
        debug!("connection handling delegated to the server");
        let server = Arc::downgrade(this);
        let target = client.core_weak();
        client.set_on_disconnection_handler(move || {
            if let Some(server) = server.upgrade() {
                server.on_client_disconnected(&target);
            }
        });
        this.clients.lock().push(client);
        Ok(())
    }

    fn on_client_disconnected(&self, target: &Weak<ClientCore>) {
        // during shutdown the clients are being disconnected by teardown
        // itself; removing here again would race the drain
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        debug!("reaping disconnected client");
        let mut clients = self.clients.lock();
        clients.retain(|client| client.core_ptr() != Weak::as_ptr(target));
    }

    fn teardown(&self, wait_for_removal: bool, recursive_wait_for_removal: bool) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            self.reactor.untrack(fd);
            if wait_for_removal {
                self.reactor.wait_for_removal(fd);
            }
        }
        self.socket.close();

        let clients: Vec<TcpClient> = self.clients.lock().drain(..).collect();
        for client in &clients {
            client.disconnect(wait_for_removal && recursive_wait_for_removal);
        }
        true
    }
}

impl Drop for ServerCore {
    fn drop(&mut self) {
        self.teardown(false, false);
    }
}
