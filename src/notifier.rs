use std::io::{self, Read, Write};

use log::trace;
use mio::unix::pipe;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// One-byte wake-up channel for the reactor.
///
/// The read end sits in every poll wait; the write end may be poked from
/// any thread that mutated tracking state and wants the reactor to
/// re-examine it. Multiple notifications collapse into a single wake-up:
/// the reactor drains the pipe once per cycle.
pub(crate) struct SelfPipe {
    sender: pipe::Sender,
    // only the poll thread touches the read end, so this lock is never
    // contended; it exists to hand out `&mut` for registration and drain
    receiver: Mutex<pipe::Receiver>,
}

impl SelfPipe {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = pipe::new().map_err(|e| Error::syscall("pipe", e))?;
        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
        })
    }

    /// Wake the reactor. Callable from any thread, never blocks.
    pub fn notify(&self) {
        // a full pipe already holds a pending wake-up, so WouldBlock is
        // success from the caller's point of view
        match (&self.sender).write(&[0]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => trace!("self-pipe notify failed: {}", e),
        }
    }

    /// Drain buffered wake-up bytes so the read end polls idle again.
    pub fn clear_buffer(&self) {
        let mut receiver = self.receiver.lock();
        let mut buf = [0u8; 64];
        loop {
            match receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!("self-pipe drain failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Put the read end into the reactor's poll set.
    pub fn register(&self, registry: &Registry, token: Token) -> Result<()> {
        registry
            .register(&mut *self.receiver.lock(), token, Interest::READABLE)
            .map_err(|e| Error::syscall("epoll_ctl", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_wakes_poll() {
        let pipe = SelfPipe::new().unwrap();
        let mut poll = mio::Poll::new().unwrap();
        let mut events = mio::Events::with_capacity(4);
        pipe.register(poll.registry(), Token(0)).unwrap();

        pipe.notify();
        poll.poll(&mut events, Some(std::time::Duration::from_millis(10)))
            .unwrap();
        assert!(events.iter().any(|e| e.token() == Token(0)));
    }

    #[test]
    fn notifications_collapse_and_drain() {
        let pipe = SelfPipe::new().unwrap();
        for _ in 0..100 {
            pipe.notify();
        }
        pipe.clear_buffer();

        // once drained, the read end must poll idle again
        let mut poll = mio::Poll::new().unwrap();
        let mut events = mio::Events::with_capacity(4);
        pipe.register(poll.registry(), Token(0)).unwrap();
        poll.poll(&mut events, Some(std::time::Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn notify_never_blocks_when_full() {
        let pipe = SelfPipe::new().unwrap();
        // far beyond any pipe buffer capacity in bytes
        for _ in 0..200_000 {
            pipe.notify();
        }
    }
}
