//! Thread-per-connection architecture.
//!
//! Each connection gets a reader thread and a writer thread, both blocking on
//! the socket. For every decoded request the reader creates a one-shot result
//! channel, passes its receiving end to the writer and submits the sort to
//! the shared pool. The writer takes receivers in the order the reader sent
//! them, so responses leave in request order even when sorts finish out of
//! order.

use super::{lock, Architecture, ClientHandler, Context};
use crate::codec::encode_message;
use crate::config::Config;
use crate::error::{ConnectionError, ServerError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info_span, trace, warn, Span};

/// How often waiting threads re-check the open flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest single read, however many bytes the decoder still wants.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Pending response: receives the sorted list from the pool.
type PendingResult = Receiver<Vec<i32>>;

/// Blocking architecture marker.
#[derive(Debug, Default)]
pub struct Blocking;

impl Architecture for Blocking {
    type Handler = BlockingHandler;

    const NAME: &'static str = "blocking";

    fn from_config(_config: &Config) -> Result<Self, ServerError> {
        Ok(Blocking)
    }

    fn make_handler(
        &self,
        id: usize,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &Arc<Context>,
    ) -> io::Result<Arc<BlockingHandler>> {
        stream.set_nodelay(true)?;
        Ok(Arc::new(BlockingHandler::new(id, stream, peer, Arc::clone(ctx))))
    }

    fn shutdown(&self, _timeout: Duration) -> Result<(), ServerError> {
        Ok(())
    }
}

/// One client connection served by a dedicated reader and writer thread.
#[derive(Debug)]
pub struct BlockingHandler {
    id: usize,
    stream: TcpStream,
    ctx: Arc<Context>,
    open: AtomicBool,
    live_threads: AtomicUsize,
    /// Disconnects once both threads have exited.
    done: Mutex<Option<Receiver<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl BlockingHandler {
    fn new(id: usize, stream: TcpStream, peer: SocketAddr, ctx: Arc<Context>) -> Self {
        Self {
            id,
            stream,
            ctx,
            open: AtomicBool::new(true),
            live_threads: AtomicUsize::new(0),
            done: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            span: info_span!("conn", id, peer = %peer),
        }
    }

    fn spawn(
        self: &Arc<Self>,
        role: &str,
        done: Sender<()>,
        body: impl FnOnce(&BlockingHandler) + Send + 'static,
    ) -> io::Result<()> {
        let handler = Arc::clone(self);
        self.live_threads.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("conn-{}-{role}", self.id))
            .spawn(move || {
                let _done = done;
                let _enter = handler.span.enter();
                body(&handler);
                handler.live_threads.fetch_sub(1, Ordering::SeqCst);
            });

        match spawned {
            Ok(thread) => {
                lock(&self.threads).push(thread);
                Ok(())
            }
            Err(e) => {
                self.live_threads.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn read_loop(&self, order: Sender<PendingResult>) {
        while self.open.load(Ordering::Acquire) {
            match self.read_message() {
                Ok(Some(list)) => {
                    trace!(len = list.len(), "Read list");
                    let (result_tx, result_rx) = mpsc::channel();
                    if order.send(result_rx).is_err() {
                        break;
                    }

                    let ctx = Arc::clone(&self.ctx);
                    let submitted = self.ctx.pool.submit(move || {
                        let mut list = list;
                        ctx.sort.sort(&mut list);
                        let _ = result_tx.send(list);
                    });
                    if let Err(e) = submitted {
                        debug!(error = %e, "Sort rejected");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Peer closed connection");
                    break;
                }
                Err(e) => {
                    if self.open.load(Ordering::Acquire) {
                        warn!(error = %e, "Connection failed");
                    }
                    self.shutdown_socket();
                    break;
                }
            }
        }
    }

    /// Read one message. `Ok(None)` on a clean end of stream between
    /// messages.
    fn read_message(&self) -> Result<Option<Vec<i32>>, ConnectionError> {
        let mut reader = self.ctx.message_reader();
        let mut buf = Vec::new();

        while reader.remaining_bytes() > 0 {
            let want = reader.remaining_bytes().min(MAX_READ_CHUNK);
            buf.resize(want, 0);

            let n = match (&self.stream).read(&mut buf[..want]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if reader.is_idle() {
                    return Ok(None);
                }
                return Err(ConnectionError::UnexpectedEof {
                    missing: reader.remaining_bytes(),
                });
            }

            reader.feed(&buf[..n])?;
        }

        Ok(reader.into_result())
    }

    fn write_loop(&self, order: Receiver<PendingResult>) {
        loop {
            let Some(pending) = self.recv_while_open(&order) else {
                break;
            };
            let Some(list) = self.recv_while_open(&pending) else {
                break;
            };

            if let Err(e) = self.write_list(&list) {
                if self.open.load(Ordering::Acquire) {
                    warn!(error = %e, "Write failed");
                }
                break;
            }
            trace!(len = list.len(), "Wrote list");
        }

        // Reader is gone and every response has been written.
        self.shutdown_socket();
    }

    fn write_list(&self, list: &[i32]) -> Result<(), ConnectionError> {
        let frame = encode_message(list, self.ctx.protocol)?;
        (&self.stream).write_all(&frame)?;
        Ok(())
    }

    /// Wait for the next value, giving up once the connection is closed or
    /// the sender is gone.
    fn recv_while_open<T>(&self, rx: &Receiver<T>) -> Option<T> {
        while self.open.load(Ordering::Acquire) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(value) => return Some(value),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    fn shutdown_socket(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                trace!(error = %e, "Socket shutdown failed");
            }
        }
    }
}

impl ClientHandler for BlockingHandler {
    fn start(self: Arc<Self>) -> io::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        let (order_tx, order_rx) = mpsc::channel::<PendingResult>();
        *lock(&self.done) = Some(done_rx);

        self.spawn("writer", done_tx.clone(), move |handler| {
            handler.write_loop(order_rx)
        })?;
        self.spawn("reader", done_tx, move |handler| handler.read_loop(order_tx))?;
        Ok(())
    }

    fn close(&self) -> Result<(), ServerError> {
        let _enter = self.span.enter();
        self.open.store(false, Ordering::Release);
        self.shutdown_socket();

        let Some(done) = lock(&self.done).take() else {
            return Ok(());
        };

        let timeout = self.ctx.shutdown_timeout;
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                // Threads still running; a later close waits for them again.
                *lock(&self.done) = Some(done);
                return Err(ServerError::ShutdownTimeout {
                    what: "connection handler",
                    timeout,
                });
            }
        }

        for thread in lock(&self.threads).drain(..) {
            let _ = thread.join();
        }

        debug!("Connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return true;
        }
        // Started, and both threads have run to completion.
        lock(&self.done).is_some() && self.live_threads.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageReader;
    use crate::protocol::Protocol;
    use std::net::TcpListener;

    fn context(workers: usize) -> Arc<Context> {
        let config = Config {
            workers: Some(workers),
            shutdown_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        Arc::new(Context::new(&config).unwrap())
    }

    /// A started handler plus the client end of its socket.
    fn connected(ctx: &Arc<Context>) -> (Arc<BlockingHandler>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        let handler = Blocking.make_handler(0, stream, peer, ctx).unwrap();
        Arc::clone(&handler).start().unwrap();
        (handler, client)
    }

    fn read_list(stream: &mut TcpStream) -> Vec<i32> {
        let mut reader = MessageReader::new(Protocol::FixedWidth);
        while reader.remaining_bytes() > 0 {
            let mut buf = vec![0; reader.remaining_bytes()];
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed early");
            reader.feed(&buf[..n]).unwrap();
        }
        reader.into_result().unwrap()
    }

    #[test]
    fn test_sorts_and_replies() {
        let ctx = context(2);
        let (handler, mut client) = connected(&ctx);

        let frame = encode_message(&[5, 3, 1, 4, 2], Protocol::FixedWidth).unwrap();
        client.write_all(&frame).unwrap();
        assert_eq!(read_list(&mut client), vec![1, 2, 3, 4, 5]);

        handler.close().unwrap();
        ctx.pool.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_close_idempotent_and_prompt() {
        let ctx = context(1);
        let (handler, _client) = connected(&ctx);

        handler.close().unwrap();
        assert!(handler.is_closed());
        handler.close().unwrap();
        assert!(lock(&handler.threads).is_empty());
        ctx.pool.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_close_retry_after_timeout_joins_threads() {
        let config = Config {
            workers: Some(1),
            shutdown_timeout: Duration::ZERO,
            ..Config::default()
        };
        let ctx = Arc::new(Context::new(&config).unwrap());
        let (handler, mut client) = connected(&ctx);

        // Keep the only worker busy so the writer sits waiting on a result.
        ctx.pool
            .submit(|| thread::sleep(Duration::from_millis(500)))
            .unwrap();
        let frame = encode_message(&[2, 1], Protocol::FixedWidth).unwrap();
        client.write_all(&frame).unwrap();
        thread::sleep(POLL_INTERVAL);

        // The writer only notices the closed flag on its next poll tick.
        assert!(matches!(
            handler.close(),
            Err(ServerError::ShutdownTimeout {
                what: "connection handler",
                ..
            })
        ));
        assert_eq!(lock(&handler.threads).len(), 2);

        thread::sleep(POLL_INTERVAL * 4);
        handler.close().unwrap();
        assert!(lock(&handler.threads).is_empty());
        assert!(handler.is_closed());
        ctx.pool.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_peer_eof_finishes_handler() {
        let ctx = context(1);
        let (handler, mut client) = connected(&ctx);

        let frame = encode_message(&[2, 1], Protocol::FixedWidth).unwrap();
        client.write_all(&frame).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        // The pending response is still delivered after the half-close.
        assert_eq!(read_list(&mut client), vec![1, 2]);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        handler.close().unwrap();
        assert!(handler.is_closed());
        ctx.pool.shutdown(Duration::from_secs(1)).unwrap();
    }
}
