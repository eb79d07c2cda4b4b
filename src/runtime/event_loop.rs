//! mio event loop with a cross-thread registration queue.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! Only the loop thread touches its `Poll`. Other threads ask for a socket to
//! be added to the interest set by pushing onto the pending queue and waking
//! the loop; the loop drains the queue between waits and registers the
//! sockets itself. The queue lock is held for the drain only, never across
//! the wait.
//!
//! mio readiness is edge-triggered, so a dispatcher must keep going until the
//! socket reports `WouldBlock` before it returns `Dispatch::Keep`.

use super::connection::Connection;
use crate::error::ServerError;
use crate::server::lock;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info_span, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// What to do with a connection after dispatching an event for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Stay in the interest set.
    Keep,
    /// Remove from the interest set.
    Unregister,
}

/// Per-event handling plugged into an event loop.
pub(crate) trait Dispatcher: Send + 'static {
    /// Readiness this loop waits for.
    const INTEREST: Interest;

    fn dispatch(&mut self, conn: &Arc<Connection>) -> Dispatch;
}

/// Cross-thread handle to a running event loop.
#[derive(Debug)]
pub(crate) struct SelectorLoop {
    name: &'static str,
    waker: Waker,
    pending: Mutex<Vec<Arc<Connection>>>,
    running: AtomicBool,
    /// Disconnects when the loop thread exits.
    done: Mutex<Option<Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SelectorLoop {
    /// Start an event loop on its own thread.
    pub(crate) fn spawn<D: Dispatcher>(
        name: &'static str,
        dispatcher: D,
        event_capacity: usize,
    ) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let handle = Arc::new(Self {
            name,
            waker,
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            done: Mutex::new(Some(done_rx)),
            thread: Mutex::new(None),
        });

        let loop_handle = Arc::clone(&handle);
        let thread = thread::Builder::new()
            .name(name.replace(' ', "-"))
            .spawn(move || {
                let _done = done_tx;
                let span = info_span!("event_loop", name);
                let _enter = span.enter();
                run_loop(poll, &loop_handle, dispatcher, event_capacity);
            })?;
        *lock(&handle.thread) = Some(thread);

        Ok(handle)
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to add `conn` to its interest set.
    ///
    /// Safe from any thread. Registering a connection that is already in the
    /// interest set is a no-op.
    pub(crate) fn register(&self, conn: Arc<Connection>) -> io::Result<()> {
        {
            let mut pending = lock(&self.pending);
            if !self.running() {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} is stopped", self.name),
                ));
            }
            pending.push(conn);
        }
        self.waker.wake()
    }

    /// Stop the loop and wait up to `timeout` for its thread to exit.
    /// Pending registrations are dropped. Idempotent.
    pub(crate) fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(name = self.name, error = %e, "Wakeup failed");
        }

        let Some(done) = lock(&self.done).take() else {
            return Ok(());
        };
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                return Err(ServerError::ShutdownTimeout {
                    what: self.name,
                    timeout,
                });
            }
        }

        if let Some(thread) = lock(&self.thread).take() {
            let _ = thread.join();
        }
        lock(&self.pending).clear();
        Ok(())
    }
}

/// Connections currently in one loop's interest set.
struct Registered {
    slots: Slab<Arc<Connection>>,
    /// Connection id -> slab key.
    by_conn: HashMap<usize, usize>,
}

impl Registered {
    fn register(&mut self, poll: &Poll, conn: Arc<Connection>, interest: Interest) {
        if self.by_conn.contains_key(&conn.id()) || conn.is_closed() {
            return;
        }

        let entry = self.slots.vacant_entry();
        let key = entry.key();
        let fd = conn.raw_fd();
        match poll
            .registry()
            .register(&mut SourceFd(&fd), Token(key), interest)
        {
            Ok(()) => {
                self.by_conn.insert(conn.id(), key);
                entry.insert(conn);
            }
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "Failed to register connection");
            }
        }
    }

    fn unregister(&mut self, poll: &Poll, key: usize) {
        if let Some(conn) = self.slots.try_remove(key) {
            self.by_conn.remove(&conn.id());
            let fd = conn.raw_fd();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                trace!(conn = conn.id(), error = %e, "Deregister failed");
            }
        }
    }
}

fn run_loop<D: Dispatcher>(
    mut poll: Poll,
    handle: &SelectorLoop,
    mut dispatcher: D,
    event_capacity: usize,
) {
    let mut events = Events::with_capacity(event_capacity);
    let mut registered = Registered {
        slots: Slab::new(),
        by_conn: HashMap::new(),
    };

    debug!("Event loop started");

    while handle.running() {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            let err = ServerError::SelectorFatal(e);
            error!(error = %err, "Event loop failed");
            break;
        }

        if !handle.running() {
            break;
        }

        let pending = std::mem::take(&mut *lock(&handle.pending));
        for conn in pending {
            registered.register(&poll, conn, D::INTEREST);
        }

        for event in events.iter() {
            let key = match event.token() {
                WAKER_TOKEN => continue,
                Token(key) => key,
            };

            let Some(conn) = registered.slots.get(key).cloned() else {
                continue;
            };

            if dispatcher.dispatch(&conn) == Dispatch::Unregister {
                registered.unregister(&poll, key);
            }
        }
    }

    // Refuse further registrations before dropping what is queued.
    {
        let mut pending = lock(&handle.pending);
        handle.running.store(false, Ordering::Release);
        pending.clear();
    }
    let keys: Vec<usize> = registered.slots.iter().map(|(key, _)| key).collect();
    for key in keys {
        registered.unregister(&poll, key);
    }

    debug!("Event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::Context;
    use std::net::TcpListener;
    use std::sync::mpsc::Sender;

    /// Reports every dispatched connection id, then unregisters it.
    struct Recorder {
        seen: Sender<usize>,
    }

    impl Dispatcher for Recorder {
        const INTEREST: Interest = Interest::WRITABLE;

        fn dispatch(&mut self, conn: &Arc<Connection>) -> Dispatch {
            let _ = self.seen.send(conn.id());
            Dispatch::Unregister
        }
    }

    fn connection(id: usize, ctx: &Arc<Context>) -> (Arc<Connection>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            id,
            mio::net::TcpStream::from_std(stream),
            peer,
            Arc::clone(ctx),
        );
        (Arc::new(conn), client)
    }

    fn context() -> Arc<Context> {
        let config = Config {
            workers: Some(1),
            ..Config::default()
        };
        Arc::new(Context::new(&config).unwrap())
    }

    #[test]
    fn test_registration_from_other_thread() {
        let ctx = context();
        let (tx, rx) = mpsc::channel();
        let handle = SelectorLoop::spawn("test loop", Recorder { seen: tx }, 16).unwrap();

        let (conn, _client) = connection(7, &ctx);
        let remote = Arc::clone(&handle);
        thread::spawn(move || remote.register(conn).unwrap())
            .join()
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        handle.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_reregister_after_unregister() {
        let ctx = context();
        let (tx, rx) = mpsc::channel();
        let handle = SelectorLoop::spawn("test loop", Recorder { seen: tx }, 16).unwrap();
        let (conn, _client) = connection(3, &ctx);

        handle.register(Arc::clone(&conn)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);

        handle.register(conn).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);

        handle.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let ctx = context();
        let (tx, _rx) = mpsc::channel();
        let handle = SelectorLoop::spawn("test loop", Recorder { seen: tx }, 16).unwrap();
        handle.shutdown(Duration::from_secs(2)).unwrap();
        handle.shutdown(Duration::from_secs(2)).unwrap();

        let (conn, _client) = connection(1, &ctx);
        assert!(handle.register(conn).is_err());
        assert!(!handle.running());
    }

    #[test]
    fn test_closed_connection_not_registered() {
        let ctx = context();
        let (tx, rx) = mpsc::channel();
        let handle = SelectorLoop::spawn("test loop", Recorder { seen: tx }, 16).unwrap();
        let (conn, _client) = connection(5, &ctx);
        conn.close();

        handle.register(conn).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        handle.shutdown(Duration::from_secs(2)).unwrap();
    }
}
