use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the library.
///
/// Synchronous entry points (`connect`, `bind`, `listen`, `accept`,
/// `start`) return these directly. Asynchronous completions never carry an
/// `Error`: workers translate failures into `success = false` results
/// before invoking user callbacks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation does not make sense in the current state: role
    /// mismatch on a socket, connecting an already-connected client,
    /// submitting a request on a disconnected one.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// An OS-level call failed. `call` names the syscall so the message
    /// reads like "recv() failure: ...".
    #[error("{call}() failure: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// `connect` exceeded its per-call deadline.
    #[error("connect() timed out")]
    Timeout,

    /// `recv` returned zero bytes: the remote host closed the connection.
    #[error("connection closed by remote peer")]
    PeerClosed,
}

impl Error {
    pub(crate) fn syscall(call: &'static str, source: io::Error) -> Self {
        Error::Syscall { call, source }
    }

    /// Whether this error signals a dead connection rather than misuse.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Error::Syscall { .. } | Error::PeerClosed)
    }
}
