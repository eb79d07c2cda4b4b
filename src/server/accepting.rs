//! Listener, accept loop and coordinated shutdown.
//!
//! The accept loop blocks in `accept`. Closing flips the run flag and then
//! opens a throwaway loopback connection to the listener, so the blocked
//! `accept` returns and the loop observes the flag.

use super::{
    lock, report_shutdown, Architecture, ClientHandler, Context, ServerCore, ServerState,
};
use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::Protocol;
use slab::Slab;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, error, info, info_span, warn, Span};

/// A server that accepts TCP clients and hands each one to its architecture.
pub struct ClientAcceptingServer<A: Architecture> {
    core: ServerCore,
    listen: SocketAddr,
    backlog: i32,
    architecture: A,
    ctx: Arc<Context>,
    clients: Mutex<Slab<Arc<A::Handler>>>,
    next_client_id: AtomicUsize,
    /// Bound address, set once the listener is up. Never reset.
    served: Mutex<Option<SocketAddr>>,
    served_cond: Condvar,
    /// Serialises `close` so a second caller returns only after the first
    /// has finished.
    closing: Mutex<()>,
    span: Span,
}

impl<A: Architecture> ClientAcceptingServer<A> {
    /// Build a server; nothing is bound until `run`.
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let listen = config
            .listen_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let ctx = Arc::new(Context::new(config)?);
        let architecture = A::from_config(config)?;

        let span = info_span!("server", arch = A::NAME);
        span.in_scope(|| {
            debug!(
                addr = %listen,
                protocol = ?config.protocol,
                workers = ctx.pool.size(),
                sort = ?config.sort,
                "Server created"
            );
        });

        Ok(Self {
            core: ServerCore::new(config.protocol, config.port),
            listen,
            backlog: config.backlog,
            architecture,
            ctx,
            clients: Mutex::new(Slab::new()),
            next_client_id: AtomicUsize::new(0),
            served: Mutex::new(None),
            served_cond: Condvar::new(),
            closing: Mutex::new(()),
            span,
        })
    }

    /// Bind, signal readiness, and accept clients until `close` is called.
    ///
    /// Blocks the calling thread.
    pub fn run(&self) -> Result<(), ServerError> {
        let _enter = self.span.enter();

        match self.core.state() {
            ServerState::Created => {}
            ServerState::Running => return Err(ServerError::AlreadyRunning),
            ServerState::Closed => return Err(ServerError::AlreadyClosed),
        }

        let listener = create_listener(self.listen, self.backlog)?;
        let local_addr = listener.local_addr()?;
        self.core.mark_running()?;

        info!(addr = %local_addr, "Bound to port");
        *lock(&self.served) = Some(local_addr);
        self.served_cond.notify_all();

        while self.core.running() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !self.core.running() {
                        debug!("Accept loop interrupted");
                        break;
                    }
                    if let Err(e) = self.register_client(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to start client handler");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.core.running() {
                        break;
                    }
                    error!(error = %e, "Accept error");
                }
            }
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Register the handler before it starts, so `close` can always reach it.
    fn register_client(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let mut clients = lock(&self.clients);
        if !self.core.running() {
            return Ok(());
        }

        clients.retain(|_, handler| !handler.is_closed());

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let handler = self
            .architecture
            .make_handler(id, stream, peer, &self.ctx)?;
        let key = clients.insert(Arc::clone(&handler));

        info!(conn = id, peer = %peer, "Client connected");

        if let Err(e) = Arc::clone(&handler).start() {
            clients.remove(key);
            report_shutdown("client", handler.close());
            return Err(e);
        }
        Ok(())
    }

    /// Block until the listener is bound; returns the bound address.
    pub fn await_served(&self) -> SocketAddr {
        let mut served = lock(&self.served);
        loop {
            if let Some(addr) = *served {
                return addr;
            }
            served = self
                .served_cond
                .wait(served)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting, close every connection, then drain the sort pool.
    ///
    /// Synchronous and idempotent. Returns the first shutdown failure, after
    /// attempting every step.
    pub fn close(&self) -> Result<(), ServerError> {
        let _closing = lock(&self.closing);
        let _enter = self.span.enter();

        if !self.core.mark_closed() {
            debug!("Server already closed");
            return Ok(());
        }
        info!("Closing");

        self.wake_acceptor();

        let timeout = self.ctx.shutdown_timeout;
        let mut first_error = report_shutdown(A::NAME, self.architecture.shutdown(timeout));

        let clients: Vec<_> = lock(&self.clients).drain().collect();
        for client in clients {
            if let Some(e) = report_shutdown("client", client.close()) {
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = report_shutdown("worker pool", self.ctx.pool.shutdown(timeout)) {
            first_error.get_or_insert(e);
        }

        info!("Closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unblock a pending `accept` by connecting to ourselves.
    fn wake_acceptor(&self) {
        let Some(addr) = *lock(&self.served) else {
            return;
        };
        let target = SocketAddr::new(connectable_ip(addr.ip()), addr.port());
        if let Err(e) = TcpStream::connect_timeout(&target, self.ctx.shutdown_timeout) {
            debug!(error = %e, "Acceptor wakeup connection failed");
        }
    }

    pub fn running(&self) -> bool {
        self.core.running()
    }

    pub fn state(&self) -> ServerState {
        self.core.state()
    }

    /// Configured port (0 means ephemeral; see `await_served`).
    pub fn port(&self) -> u16 {
        self.core.port()
    }

    pub fn protocol(&self) -> Protocol {
        self.core.protocol()
    }

    /// Number of sort worker threads.
    pub fn pool_size(&self) -> usize {
        self.ctx.pool.size()
    }

    /// Connections registered and not yet finished.
    pub fn connection_count(&self) -> usize {
        lock(&self.clients)
            .iter()
            .filter(|(_, handler)| !handler.is_closed())
            .count()
    }
}

impl<A: Architecture> Drop for ClientAcceptingServer<A> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Server shutdown on drop failed");
        }
    }
}

/// Listening sockets bound to the unspecified address are reached via loopback.
fn connectable_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// Create a blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectable_ip() {
        assert_eq!(
            connectable_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            connectable_ip(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(connectable_ip(ip), ip);
    }

    #[test]
    fn test_create_listener_ephemeral() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        TcpStream::connect(addr).unwrap();
        assert!(listener.accept().is_ok());
    }
}
