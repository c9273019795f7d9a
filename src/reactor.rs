use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::notifier::SelfPipe;
use crate::pool::ThreadPool;
use crate::{DEFAULT_NB_WORKERS, POLL_TIMEOUT};

/// Callback fired on a worker thread when a tracked socket reports ready
/// in the matching direction.
pub type EventCallback = Arc<dyn Fn(RawFd) + Send + Sync + 'static>;

// well above any fd-derived token, and clear of the reserved usize::MAX
const WAKE: Token = Token(usize::MAX - 1);

/// Per-socket tracking record.
///
/// The in-flight flags serve two purposes: they suppress the interest bit
/// while a worker is still inside the callback (the backend would
/// otherwise hand the same readiness to a second worker), and they defer
/// entry removal until no worker holds a reference to the callback.
#[derive(Default)]
struct TrackedSocket {
    rd_callback: Option<EventCallback>,
    wr_callback: Option<EventCallback>,
    rd_in_flight: AtomicBool,
    wr_in_flight: AtomicBool,
    marked_for_untrack: AtomicBool,
    // interest currently installed in the OS registry for this fd
    registered: Option<Interest>,
}

impl TrackedSocket {
    fn desired_interest(&self) -> Option<Interest> {
        let rd = self.rd_callback.is_some() && !self.rd_in_flight.load(Ordering::Relaxed);
        let wr = self.wr_callback.is_some() && !self.wr_in_flight.load(Ordering::Relaxed);
        match (rd, wr) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn idle_and_marked(&self) -> bool {
        self.marked_for_untrack.load(Ordering::Relaxed)
            && !self.rd_in_flight.load(Ordering::Relaxed)
            && !self.wr_in_flight.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

struct Shared {
    tracked: Mutex<HashMap<RawFd, TrackedSocket>>,
    removal: Condvar,
    notifier: SelfPipe,
    registry: Registry,
    should_stop: AtomicBool,
    pool: ThreadPool,
}

/// Multiplexes every tracked socket onto one poll thread and hands ready
/// events to a worker pool.
///
/// One instance is normally shared process-wide (see [`default_reactor`]);
/// clients and servers keep an `Arc` to the reactor they registered with.
pub struct Reactor {
    shared: Arc<Shared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Start a reactor with its own poll thread and `nb_workers` callback
    /// workers.
    pub fn new(nb_workers: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::syscall("epoll_create", e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::syscall("dup", e))?;

        let notifier = SelfPipe::new()?;
        notifier.register(&registry, WAKE)?;

        let shared = Arc::new(Shared {
            tracked: Mutex::new(HashMap::new()),
            removal: Condvar::new(),
            notifier,
            registry,
            should_stop: AtomicBool::new(false),
            pool: ThreadPool::new(nb_workers),
        });

        let handle = thread::Builder::new()
            .name("wirepool-reactor".into())
            .spawn({
                let shared = shared.clone();
                move || poll_loop(&shared, poll)
            })
            .map_err(|e| Error::syscall("clone", e))?;

        debug!("reactor started with {} worker(s)", nb_workers);

        Ok(Self {
            shared,
            poll_thread: Mutex::new(Some(handle)),
        })
    }

    /// Resize the callback worker pool.
    pub fn set_nb_workers(&self, nb_workers: usize) {
        self.shared.pool.set_nb_threads(nb_workers);
    }

    /// Insert or overwrite the tracking entry for `fd`, clearing all
    /// bookkeeping flags.
    pub fn track(&self, fd: RawFd, rd_callback: Option<EventCallback>, wr_callback: Option<EventCallback>) {
        let mut tracked = self.shared.tracked.lock();
        debug!("track socket {}", fd);

        let entry = tracked.entry(fd).or_default();
        entry.rd_callback = rd_callback;
        entry.wr_callback = wr_callback;
        entry.rd_in_flight.store(false, Ordering::Relaxed);
        entry.wr_in_flight.store(false, Ordering::Relaxed);
        entry.marked_for_untrack.store(false, Ordering::Relaxed);

        self.shared.notifier.notify();
    }

    /// Update just the read callback; creates the entry if `fd` is not
    /// tracked yet. `None` withdraws read interest.
    pub fn set_rd_callback(&self, fd: RawFd, callback: Option<EventCallback>) {
        let mut tracked = self.shared.tracked.lock();
        trace!("update read callback for socket {}", fd);
        tracked.entry(fd).or_default().rd_callback = callback;
        self.shared.notifier.notify();
    }

    /// Write-direction twin of [`set_rd_callback`](Self::set_rd_callback).
    pub fn set_wr_callback(&self, fd: RawFd, callback: Option<EventCallback>) {
        let mut tracked = self.shared.tracked.lock();
        trace!("update write callback for socket {}", fd);
        tracked.entry(fd).or_default().wr_callback = callback;
        self.shared.notifier.notify();
    }

    /// Remove `fd` from the reactor.
    ///
    /// If a worker is currently inside one of the fd's callbacks the entry
    /// is only marked: the last finishing worker erases it. Erasure is
    /// what [`wait_for_removal`](Self::wait_for_removal) observes.
    pub fn untrack(&self, fd: RawFd) {
        let mut tracked = self.shared.tracked.lock();

        if let Some(entry) = tracked.get_mut(&fd) {
            if entry.rd_in_flight.load(Ordering::Relaxed) || entry.wr_in_flight.load(Ordering::Relaxed) {
                debug!("mark socket {} for untracking", fd);
                entry.marked_for_untrack.store(true, Ordering::Relaxed);
            } else {
                debug!("untrack socket {}", fd);
                if entry.registered.is_some() {
                    deregister(&self.shared.registry, fd);
                }
                tracked.remove(&fd);
                self.shared.removal.notify_all();
            }
        }

        self.shared.notifier.notify();
    }

    /// Block until the tracking entry for `fd` is gone, i.e. until every
    /// pending callback for it has returned.
    pub fn wait_for_removal(&self, fd: RawFd) {
        let mut tracked = self.shared.tracked.lock();
        trace!("waiting for socket {} removal", fd);
        while tracked.contains_key(&fd) {
            self.shared.removal.wait(&mut tracked);
        }
    }

    /// Number of sockets currently tracked.
    pub fn nb_tracked_sockets(&self) -> usize {
        self.shared.tracked.lock().len()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        debug!("stopping reactor");
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.notifier.notify();
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.pool.stop();
    }
}

fn poll_loop(shared: &Arc<Shared>, mut poll: Poll) {
    debug!("reactor poll loop started");

    let mut events = Events::with_capacity(1024);
    while !shared.should_stop.load(Ordering::Acquire) {
        sync_registrations(shared);

        match poll.poll(&mut events, POLL_TIMEOUT) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("poll failure: {}", e);
                continue;
            }
        }

        if !events.is_empty() {
            process_events(shared, &events);
        } else {
            trace!("poll woke up, but nothing to process");
        }
    }

    debug!("reactor poll loop stopped");
}

/// Reconcile the OS registry with the tracked map; the step-1 rebuild of
/// every poll cycle.
///
/// Entries whose deferred untrack has fully drained are erased here, so a
/// socket never outlives its last callback by more than one cycle even if
/// no further event arrives for it.
fn sync_registrations(shared: &Shared) {
    let mut tracked = shared.tracked.lock();

    let mut erased = false;
    tracked.retain(|&fd, entry| {
        if !entry.idle_and_marked() {
            return true;
        }
        debug!("untrack socket {}", fd);
        if entry.registered.is_some() {
            deregister(&shared.registry, fd);
        }
        erased = true;
        false
    });
    if erased {
        shared.removal.notify_all();
    }

    for (&fd, entry) in tracked.iter_mut() {
        let desired = entry.desired_interest();
        match (entry.registered, desired) {
            (was_registered, Some(interest)) => {
                // applied every cycle on purpose even when the mask is
                // unchanged: the modify re-arms edge-triggered backends,
                // so a socket whose buffered data was only partially
                // consumed reports readable again
                if install_interest(&shared.registry, fd, interest, was_registered.is_some()) {
                    entry.registered = Some(interest);
                } else {
                    entry.registered = None;
                }
            }
            (Some(_), None) => {
                deregister(&shared.registry, fd);
                entry.registered = None;
            }
            (None, None) => {}
        }
    }
}

/// Install `interest` for `fd`, recovering from a stale registration
/// cache: a closed fd silently leaves the OS set, and its number may come
/// back for a brand-new socket.
fn install_interest(registry: &Registry, fd: RawFd, interest: Interest, already_registered: bool) -> bool {
    let token = Token(fd as usize);
    let primary = if already_registered {
        registry.reregister(&mut SourceFd(&fd), token, interest)
    } else {
        registry.register(&mut SourceFd(&fd), token, interest)
    };
    if primary.is_ok() {
        return true;
    }

    let fallback = if already_registered {
        registry.register(&mut SourceFd(&fd), token, interest)
    } else {
        registry.reregister(&mut SourceFd(&fd), token, interest)
    };
    match fallback {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to register socket {}: {}", fd, e);
            false
        }
    }
}

fn process_events(shared: &Arc<Shared>, events: &Events) {
    let mut tracked = shared.tracked.lock();
    trace!("processing events");

    for event in events {
        if event.token() == WAKE {
            shared.notifier.clear_buffer();
            continue;
        }

        let fd = event.token().0 as RawFd;
        // the entry may have vanished between poll and lock acquisition
        let Some(entry) = tracked.get_mut(&fd) else {
            continue;
        };

        if event.is_readable()
            && entry.rd_callback.is_some()
            && !entry.rd_in_flight.load(Ordering::Relaxed)
        {
            dispatch(shared, fd, entry, Direction::Read);
        }
        if event.is_writable()
            && entry.wr_callback.is_some()
            && !entry.wr_in_flight.load(Ordering::Relaxed)
        {
            dispatch(shared, fd, entry, Direction::Write);
        }

        if entry.idle_and_marked() {
            debug!("untrack socket {}", fd);
            if entry.registered.is_some() {
                deregister(&shared.registry, fd);
            }
            tracked.remove(&fd);
            shared.removal.notify_all();
        }
    }
}

/// Hand one ready callback to the pool and flag the direction in-flight.
fn dispatch(shared: &Arc<Shared>, fd: RawFd, entry: &mut TrackedSocket, direction: Direction) {
    let callback = match direction {
        Direction::Read => {
            trace!("dispatching read event for socket {}", fd);
            entry.rd_callback.clone()
        }
        Direction::Write => {
            trace!("dispatching write event for socket {}", fd);
            entry.wr_callback.clone()
        }
    };
    let Some(callback) = callback else {
        return;
    };
    match direction {
        Direction::Read => entry.rd_in_flight.store(true, Ordering::Relaxed),
        Direction::Write => entry.wr_in_flight.store(true, Ordering::Relaxed),
    }

    let task_shared = Arc::clone(shared);
    shared.pool.submit(Box::new(move || {
        callback(fd);
        task_shared.complete(fd, direction);
    }));
}

impl Shared {
    fn complete(&self, fd: RawFd, direction: Direction) {
        let mut tracked = self.tracked.lock();

        if let Some(entry) = tracked.get_mut(&fd) {
            let (own, other) = match direction {
                Direction::Read => (&entry.rd_in_flight, &entry.wr_in_flight),
                Direction::Write => (&entry.wr_in_flight, &entry.rd_in_flight),
            };
            own.store(false, Ordering::Relaxed);

            if entry.marked_for_untrack.load(Ordering::Relaxed) && !other.load(Ordering::Relaxed) {
                debug!("untrack socket {}", fd);
                if entry.registered.is_some() {
                    deregister(&self.registry, fd);
                }
                tracked.remove(&fd);
                self.removal.notify_all();
            }
        }

        self.notifier.notify();
    }
}

fn deregister(registry: &Registry, fd: RawFd) {
    // the fd may already be closed; epoll drops closed fds on its own
    if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
        trace!("failed to deregister socket {}: {}", fd, e);
    }
}

//
// default process-wide reactor
//

static DEFAULT_REACTOR: OnceLock<RwLock<Option<Arc<Reactor>>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<Arc<Reactor>>> {
    DEFAULT_REACTOR.get_or_init(|| RwLock::new(None))
}

/// The process-wide shared reactor, started lazily on first access with
/// [`DEFAULT_NB_WORKERS`] callback workers.
pub fn default_reactor() -> Result<Arc<Reactor>> {
    if let Some(reactor) = default_slot().read().as_ref() {
        return Ok(reactor.clone());
    }

    let mut slot = default_slot().write();
    if let Some(reactor) = slot.as_ref() {
        return Ok(reactor.clone());
    }
    let reactor = Arc::new(Reactor::new(DEFAULT_NB_WORKERS)?);
    *slot = Some(reactor.clone());
    Ok(reactor)
}

/// Replace the process-wide reactor.
///
/// Only safe while no client or server is registered with the previous
/// instance; the library does not check this.
pub fn set_default_reactor(reactor: Arc<Reactor>) {
    debug!("setting new default reactor");
    *default_slot().write() = Some(reactor);
}
