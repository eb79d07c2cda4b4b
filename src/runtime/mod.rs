//! Selector-multiplexed runtime.
//!
//! Readiness-based I/O on mio (epoll on Linux, kqueue on macOS):
//! - one read loop decodes requests for every connection
//! - one write loop drains every connection's outbound queue
//!
//! Sort work runs on the server's worker pool. A finished sort queues its
//! response on the connection and hands the connection to the write loop
//! through the loop's registration queue.

mod connection;
mod event_loop;

use crate::codec::encode_message;
use crate::config::Config;
use crate::error::ServerError;
use crate::server::{report_shutdown, Architecture, ClientHandler, Context};
use connection::{Connection, ReadState, WriteState};
use event_loop::{Dispatch, Dispatcher, SelectorLoop};
use mio::Interest;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Non-blocking architecture: two event loops shared by all connections.
#[derive(Debug)]
pub struct NonBlocking {
    read_loop: Arc<SelectorLoop>,
    write_loop: Arc<SelectorLoop>,
}

impl Architecture for NonBlocking {
    type Handler = NonBlockingHandler;

    const NAME: &'static str = "nonblocking";

    fn from_config(config: &Config) -> Result<Self, ServerError> {
        let write_loop = SelectorLoop::spawn("write loop", WriteDispatch, config.event_capacity)?;
        let read_dispatch = ReadDispatch {
            write_loop: Arc::clone(&write_loop),
            scratch: Vec::new(),
        };
        let read_loop = match SelectorLoop::spawn("read loop", read_dispatch, config.event_capacity)
        {
            Ok(read_loop) => read_loop,
            Err(e) => {
                report_shutdown("write loop", write_loop.shutdown(config.shutdown_timeout));
                return Err(e.into());
            }
        };

        Ok(Self {
            read_loop,
            write_loop,
        })
    }

    fn make_handler(
        &self,
        id: usize,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &Arc<Context>,
    ) -> io::Result<Arc<NonBlockingHandler>> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_std(stream);

        Ok(Arc::new(NonBlockingHandler {
            conn: Arc::new(Connection::new(id, stream, peer, Arc::clone(ctx))),
            read_loop: Arc::clone(&self.read_loop),
        }))
    }

    /// Stop both loops. Their connections stay open until the server closes
    /// them.
    fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        let read = self.read_loop.shutdown(timeout);
        let write = self.write_loop.shutdown(timeout);
        read.and(write)
    }
}

/// Handle the accepting server keeps for one selector-driven connection.
#[derive(Debug)]
pub struct NonBlockingHandler {
    conn: Arc<Connection>,
    read_loop: Arc<SelectorLoop>,
}

impl ClientHandler for NonBlockingHandler {
    fn start(self: Arc<Self>) -> io::Result<()> {
        self.read_loop.register(Arc::clone(&self.conn))
    }

    fn close(&self) -> Result<(), ServerError> {
        let _enter = self.conn.span().enter();
        self.conn.close();
        debug!("Connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_finished()
    }
}

/// Read-readiness handling: decode, then submit each list to the pool.
struct ReadDispatch {
    write_loop: Arc<SelectorLoop>,
    scratch: Vec<u8>,
}

impl Dispatcher for ReadDispatch {
    const INTEREST: Interest = Interest::READABLE;

    fn dispatch(&mut self, conn: &Arc<Connection>) -> Dispatch {
        let _enter = conn.span().enter();
        if conn.is_closed() {
            return Dispatch::Unregister;
        }

        let write_loop = &self.write_loop;
        let state = conn.read_available(&mut self.scratch, |list| {
            trace!(len = list.len(), "Read list");
            submit_sort(conn, write_loop, list);
        });

        match state {
            Ok(ReadState::WouldBlock) => Dispatch::Keep,
            Ok(ReadState::Eof) => {
                debug!("Peer closed connection");
                conn.mark_read_closed();
                conn.finish_if_done();
                Dispatch::Unregister
            }
            Err(e) => {
                warn!(error = %e, "Connection failed");
                conn.close();
                Dispatch::Unregister
            }
        }
    }
}

/// Sort on the pool, queue the response, then hand the connection to the
/// write loop.
fn submit_sort(conn: &Arc<Connection>, write_loop: &Arc<SelectorLoop>, list: Vec<i32>) {
    conn.begin_task();

    let task_conn = Arc::clone(conn);
    let write_loop = Arc::clone(write_loop);
    let submitted = conn.ctx().pool.submit(move || {
        let conn = task_conn;
        let _enter = conn.span().enter();

        let mut list = list;
        conn.ctx().sort.sort(&mut list);

        match encode_message(&list, conn.ctx().protocol) {
            Ok(frame) => conn.enqueue(frame),
            Err(e) => {
                warn!(error = %e, "Failed to encode response");
                conn.close();
            }
        }
        conn.end_task();

        if let Err(e) = write_loop.register(Arc::clone(&conn)) {
            debug!(error = %e, "Write loop unavailable");
        }
    });

    if let Err(e) = submitted {
        debug!(error = %e, "Sort rejected");
        conn.end_task();
        conn.close();
    }
}

/// Write-readiness handling: drain the outbound queue.
struct WriteDispatch;

impl Dispatcher for WriteDispatch {
    const INTEREST: Interest = Interest::WRITABLE;

    fn dispatch(&mut self, conn: &Arc<Connection>) -> Dispatch {
        let _enter = conn.span().enter();
        if conn.is_closed() {
            return Dispatch::Unregister;
        }

        match conn.write_pending() {
            Ok(WriteState::Drained) => {
                conn.finish_if_done();
                Dispatch::Unregister
            }
            Ok(WriteState::Blocked) => Dispatch::Keep,
            Err(e) => {
                warn!(error = %e, "Write failed");
                conn.close();
                Dispatch::Unregister
            }
        }
    }
}
