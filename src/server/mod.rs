//! Server core shared by both architectures.
//!
//! A server moves through `Created -> Running -> Closed`, one way only.
//! `ClientAcceptingServer` owns the listener, the live-connection registry and
//! the sort pool; an `Architecture` decides how each accepted connection is
//! read from and written to.

mod accepting;
mod blocking;
mod pool;

pub use accepting::ClientAcceptingServer;
pub use blocking::{Blocking, BlockingHandler};
pub use pool::WorkerPool;

use crate::codec::MessageReader;
use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::Protocol;
use crate::runtime::NonBlocking;
use crate::sort::SortStrategy;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::error;

/// Thread-per-connection server.
pub type BlockingServer = ClientAcceptingServer<Blocking>;

/// Selector-multiplexed server.
pub type NonBlockingServer = ClientAcceptingServer<NonBlocking>;

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, listener not bound yet.
    Created,
    /// Listener bound, accept loop active.
    Running,
    /// Close requested. Terminal.
    Closed,
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Run flag, port and protocol of a server. Readable from any thread.
#[derive(Debug)]
pub struct ServerCore {
    state: AtomicU8,
    port: u16,
    protocol: Protocol,
}

impl ServerCore {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            state: AtomicU8::new(CREATED),
            port,
            protocol,
        }
    }

    pub fn state(&self) -> ServerState {
        match self.state.load(Ordering::Acquire) {
            CREATED => ServerState::Created,
            RUNNING => ServerState::Running,
            _ => ServerState::Closed,
        }
    }

    pub fn running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Configured port (0 means ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// `Created -> Running`.
    fn mark_running(&self) -> Result<(), ServerError> {
        self.state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| match current {
                RUNNING => ServerError::AlreadyRunning,
                _ => ServerError::AlreadyClosed,
            })
    }

    /// Move to `Closed`. Returns false if the server was already closed.
    fn mark_closed(&self) -> bool {
        self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }
}

/// Everything a connection handler needs from its server.
#[derive(Debug)]
pub struct Context {
    pub(crate) protocol: Protocol,
    pub(crate) sort: SortStrategy,
    pub(crate) max_message_bytes: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) pool: WorkerPool,
}

impl Context {
    pub(crate) fn new(config: &Config) -> Result<Self, ServerError> {
        Ok(Self {
            protocol: config.protocol,
            sort: config.sort,
            max_message_bytes: config.max_message_bytes,
            shutdown_timeout: config.shutdown_timeout,
            pool: WorkerPool::new(config.pool_size())?,
        })
    }

    /// Fresh decoder for the next incoming message.
    pub(crate) fn message_reader(&self) -> MessageReader {
        MessageReader::with_limit(self.protocol, self.max_message_bytes)
    }
}

/// A server concurrency strategy: builds a handler per accepted connection.
pub trait Architecture: Send + Sync + Sized + 'static {
    type Handler: ClientHandler;

    /// Name used in logs.
    const NAME: &'static str;

    fn from_config(config: &Config) -> Result<Self, ServerError>;

    /// Wrap an accepted socket. The handler must not start any I/O until
    /// `ClientHandler::start`.
    fn make_handler(
        &self,
        id: usize,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &Arc<Context>,
    ) -> std::io::Result<Arc<Self::Handler>>;

    /// Tear down architecture-wide machinery. Called once, before handlers
    /// are closed.
    fn shutdown(&self, timeout: Duration) -> Result<(), ServerError>;
}

/// One accepted connection.
pub trait ClientHandler: Send + Sync + 'static {
    /// Begin the read/process/write lifecycle.
    fn start(self: Arc<Self>) -> std::io::Result<()>;

    /// Stop all I/O and release the socket. Idempotent, safe after failure.
    fn close(&self) -> Result<(), ServerError>;

    /// True once the connection has nothing left to do.
    fn is_closed(&self) -> bool;
}

/// Log a failed teardown step at error level and hand the error back.
pub(crate) fn report_shutdown(
    what: &str,
    result: Result<(), ServerError>,
) -> Option<ServerError> {
    let err = result.err()?;
    error!(error = %err, "Failed to stop {what}");
    Some(err)
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let core = ServerCore::new(Protocol::FixedWidth, 0);
        assert_eq!(core.state(), ServerState::Created);
        assert!(!core.running());

        core.mark_running().unwrap();
        assert!(core.running());
        assert!(matches!(
            core.mark_running(),
            Err(ServerError::AlreadyRunning)
        ));

        assert!(core.mark_closed());
        assert_eq!(core.state(), ServerState::Closed);
        assert!(!core.mark_closed());
    }

    #[test]
    fn test_closed_is_terminal() {
        let core = ServerCore::new(Protocol::Cbor, 8000);
        assert!(core.mark_closed());
        assert!(matches!(core.mark_running(), Err(ServerError::AlreadyClosed)));
        assert_eq!(core.state(), ServerState::Closed);
        assert_eq!(core.port(), 8000);
        assert_eq!(core.protocol(), Protocol::Cbor);
    }

    #[test]
    fn test_report_shutdown_keeps_timeout() {
        assert!(report_shutdown("client", Ok(())).is_none());

        let timeout = Duration::from_millis(10);
        let reported = report_shutdown(
            "client",
            Err(ServerError::ShutdownTimeout {
                what: "connection handler",
                timeout,
            }),
        );
        assert!(matches!(
            reported,
            Some(ServerError::ShutdownTimeout {
                what: "connection handler",
                ..
            })
        ));
    }

    #[test]
    fn test_context_reader_limit() {
        let config = Config {
            max_message_bytes: 8,
            workers: Some(1),
            ..Config::default()
        };
        let ctx = Context::new(&config).unwrap();
        let mut reader = ctx.message_reader();
        assert!(reader.feed(&[0, 0, 0, 12]).is_err());
        ctx.pool.shutdown(Duration::from_secs(1)).unwrap();
    }
}
