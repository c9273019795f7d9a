//! Event-driven TCP networking over a shared reactor.
//!
//! One poll thread multiplexes every tracked socket; ready events are run
//! as callbacks on a small worker pool. [`TcpClient`] queues asynchronous
//! reads and writes per connection, [`TcpServer`] accepts connections and
//! hands them out through a hook, and both default to a lazily-started
//! process-wide [`Reactor`].
//!
//! ```no_run
//! use wirepool::{ReadRequest, TcpClient, TcpServer, WriteRequest};
//!
//! # fn main() -> wirepool::Result<()> {
//! let server = TcpServer::new()?;
//! server.start("127.0.0.1", 3001, |client| {
//!     println!("new client {}:{}", client.host(), client.port());
//!     false // let the server own the connection
//! })?;
//!
//! let client = TcpClient::new()?;
//! client.connect("127.0.0.1", 3001, None)?;
//! client.async_write(WriteRequest {
//!     buffer: b"hello".to_vec(),
//!     on_complete: None,
//! })?;
//! client.async_read(ReadRequest {
//!     size_to_read: 1024,
//!     on_complete: Some(Box::new(|result| {
//!         println!("read {} bytes", result.buffer.len());
//!     })),
//! })?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod error;
pub mod net;
mod notifier;
mod pool;
pub mod reactor;

pub use error::{Error, Result};
pub use net::{ReadRequest, ReadResult, Role, TcpClient, TcpServer, TcpSocket, WriteRequest, WriteResult};
pub use reactor::{default_reactor, set_default_reactor, EventCallback, Reactor};

/// Workers in the default reactor's callback pool.
pub const DEFAULT_NB_WORKERS: usize = 1;

/// Backlog handed to `listen` by [`TcpServer::start`].
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Upper bound on one reactor wait; `None` waits until an event or a
/// self-pipe wake-up.
pub const POLL_TIMEOUT: Option<Duration> = None;
