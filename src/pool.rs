use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size group of threads draining a FIFO of callback tasks.
///
/// The pool can be resized while running: growing spawns threads
/// immediately, shrinking lets surplus workers finish their current task
/// and exit on their next trip through the queue.
pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    task_available: Condvar,
}

struct State {
    tasks: VecDeque<Task>,
    nb_target: usize,
    nb_running: usize,
    should_stop: bool,
}

impl State {
    fn worker_should_exit(&self) -> bool {
        self.should_stop || self.nb_running > self.nb_target
    }
}

impl ThreadPool {
    pub fn new(nb_threads: usize) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    nb_target: 0,
                    nb_running: 0,
                    should_stop: false,
                }),
                task_available: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        };
        pool.set_nb_threads(nb_threads);
        pool
    }

    /// Append a task and wake one idle worker.
    pub fn submit(&self, task: Task) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(task);
        self.shared.task_available.notify_one();
    }

    /// Change the target worker count.
    ///
    /// Growing spawns the missing workers right away. Shrinking broadcasts
    /// so idle workers re-check the target and exit; busy workers finish
    /// the task in hand first.
    pub fn set_nb_threads(&self, nb_threads: usize) {
        let mut spawned = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.nb_target = nb_threads;

            while state.nb_running < state.nb_target {
                state.nb_running += 1;
                let shared = self.shared.clone();
                let handle = thread::Builder::new()
                    .name(format!("wirepool-worker-{}", state.nb_running))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker");
                spawned.push(handle);
            }

            if state.nb_running > state.nb_target {
                self.shared.task_available.notify_all();
            }
        }
        // handles are pushed outside the state lock so that stop(), which
        // joins while holding the handle list, cannot deadlock with us
        self.handles.lock().extend(spawned);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.state.lock().should_stop
    }

    /// Stop accepting work and join every worker. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.should_stop {
                return;
            }
            state.should_stop = true;
        }
        self.shared.task_available.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    debug!("pool worker started");

    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.worker_should_exit() {
                    state.nb_running -= 1;
                    debug!("pool worker exiting");
                    return;
                }
                match state.tasks.pop_front() {
                    Some(task) => break task,
                    None => shared.task_available.wait(&mut state),
                }
            }
        };

        // a panicking user callback must not take the worker down with it
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("task panicked inside the thread pool; panic discarded");
        }
    }
}
