//! Per-connection state for the non-blocking runtime.
//!
//! A connection is shared between the read loop, the write loop and sort
//! tasks on the pool. The read loop alone drives the decoder; pool threads
//! append to the outbound queue and the write loop drains it.

use crate::codec::MessageReader;
use crate::error::ConnectionError;
use crate::server::{lock, Context};
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info_span, trace, Span};

/// Largest single read, however many bytes the decoder still wants.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Where a read dispatch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// No bytes available right now; wait for the next readiness event.
    WouldBlock,
    /// Peer closed its sending side between messages.
    Eof,
}

/// Where a write dispatch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    /// Outbound queue is empty.
    Drained,
    /// Socket buffer is full; the head buffer resumes on the next event.
    Blocked,
}

/// A client connection served by the event loops.
#[derive(Debug)]
pub(crate) struct Connection {
    id: usize,
    stream: TcpStream,
    ctx: Arc<Context>,
    /// Decoder for the message currently arriving.
    reader: Mutex<MessageReader>,
    /// Encoded responses waiting to be written, head possibly part-written.
    outbound: Mutex<VecDeque<Bytes>>,
    /// Sort tasks submitted whose response is not queued yet.
    in_flight: AtomicUsize,
    read_closed: AtomicBool,
    closed: AtomicBool,
    span: Span,
}

impl Connection {
    pub(crate) fn new(id: usize, stream: TcpStream, peer: SocketAddr, ctx: Arc<Context>) -> Self {
        Self {
            id,
            stream,
            reader: Mutex::new(ctx.message_reader()),
            ctx,
            outbound: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            read_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            span: info_span!("conn", id, peer = %peer),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Read until the socket would block or the peer closes, handing every
    /// completed list to `on_message`.
    ///
    /// Each read is sized to what the decoder still needs, so a read never
    /// spans two messages.
    pub(crate) fn read_available(
        &self,
        scratch: &mut Vec<u8>,
        mut on_message: impl FnMut(Vec<i32>),
    ) -> Result<ReadState, ConnectionError> {
        let mut reader = lock(&self.reader);

        loop {
            let want = reader.remaining_bytes().min(MAX_READ_CHUNK);
            scratch.resize(want, 0);

            let n = match (&self.stream).read(&mut scratch[..want]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadState::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if reader.is_idle() {
                    return Ok(ReadState::Eof);
                }
                return Err(ConnectionError::UnexpectedEof {
                    missing: reader.remaining_bytes(),
                });
            }

            trace!(bytes = n, "Read from socket");
            reader.feed(&scratch[..n])?;

            if reader.is_complete() {
                let complete = std::mem::replace(&mut *reader, self.ctx.message_reader());
                if let Some(list) = complete.into_result() {
                    on_message(list);
                }
            }
        }
    }

    /// Queue an encoded response.
    pub(crate) fn enqueue(&self, frame: Bytes) {
        if self.is_closed() {
            return;
        }
        lock(&self.outbound).push_back(frame);
    }

    /// Write queued responses until the queue empties or the socket blocks.
    pub(crate) fn write_pending(&self) -> Result<WriteState, ConnectionError> {
        let mut queue = lock(&self.outbound);

        while let Some(head) = queue.front_mut() {
            match (&self.stream).write(&head[..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    trace!(bytes = n, "Wrote to socket");
                    head.advance(n);
                    if head.is_empty() {
                        queue.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteState::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(WriteState::Drained)
    }

    pub(crate) fn begin_task(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_task(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_read_closed(&self) {
        self.read_closed.store(true, Ordering::SeqCst);
    }

    /// Close the socket once the peer has stopped sending and every
    /// response has been written.
    pub(crate) fn finish_if_done(&self) {
        if self.is_finished() {
            self.close();
        }
    }

    /// Peer done sending, no sort outstanding, nothing left to write.
    fn is_drained(&self) -> bool {
        self.read_closed.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) == 0
            && lock(&self.outbound).is_empty()
    }

    /// Shut the socket down and drop queued output. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                trace!(error = %e, "Socket shutdown failed");
            }
        }
        lock(&self.outbound).clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closed, or nothing left to do.
    pub(crate) fn is_finished(&self) -> bool {
        self.is_closed() || self.is_drained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_message;
    use crate::config::Config;
    use crate::protocol::Protocol;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn pair() -> (Connection, std::net::TcpStream) {
        let config = Config {
            workers: Some(1),
            ..Config::default()
        };
        let ctx = Arc::new(Context::new(&config).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        (
            Connection::new(1, TcpStream::from_std(stream), peer, ctx),
            client,
        )
    }

    /// Keep reading until `count` lists arrived or the deadline passes.
    fn read_lists(conn: &Connection, count: usize) -> (Vec<Vec<i32>>, ReadState) {
        let mut scratch = Vec::new();
        let mut lists = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let state = conn
                .read_available(&mut scratch, |list| lists.push(list))
                .unwrap();
            if lists.len() >= count || state == ReadState::Eof || Instant::now() > deadline {
                return (lists, state);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_would_block_when_idle() {
        let (conn, _client) = pair();
        let mut scratch = Vec::new();
        let state = conn.read_available(&mut scratch, |_| panic!("no data")).unwrap();
        assert_eq!(state, ReadState::WouldBlock);
    }

    #[test]
    fn test_reads_back_to_back_messages() {
        let (conn, mut client) = pair();
        let mut bytes = encode_message(&[3, 1], Protocol::FixedWidth).unwrap().to_vec();
        bytes.extend_from_slice(&encode_message(&[], Protocol::FixedWidth).unwrap());
        bytes.extend_from_slice(&encode_message(&[9], Protocol::FixedWidth).unwrap());
        client.write_all(&bytes).unwrap();

        let (lists, _) = read_lists(&conn, 3);
        assert_eq!(lists, vec![vec![3, 1], vec![], vec![9]]);
    }

    #[test]
    fn test_eof_versus_truncated() {
        let (conn, mut client) = pair();
        client.write_all(&[0, 0]).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut scratch = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = loop {
            match conn.read_available(&mut scratch, |_| {}) {
                Ok(ReadState::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Ok(state) => panic!("unexpected: {:?}", state),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ConnectionError::UnexpectedEof { missing: 2 }));

        let (conn, client) = pair();
        client.shutdown(Shutdown::Write).unwrap();
        let (_, state) = read_lists(&conn, 1);
        assert_eq!(state, ReadState::Eof);
    }

    #[test]
    fn test_write_pending_drains_queue() {
        let (conn, mut client) = pair();
        let frame = encode_message(&[1, 2, 3], Protocol::FixedWidth).unwrap();
        conn.enqueue(frame.clone());
        conn.enqueue(frame.clone());

        assert_eq!(conn.write_pending().unwrap(), WriteState::Drained);

        let mut received = vec![0; frame.len() * 2];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received[..frame.len()], &frame[..]);
        assert_eq!(&received[frame.len()..], &frame[..]);
    }

    #[test]
    fn test_finish_after_read_closed_and_drained() {
        let (conn, _client) = pair();
        conn.begin_task();
        conn.mark_read_closed();
        conn.finish_if_done();
        assert!(!conn.is_closed());

        conn.end_task();
        conn.finish_if_done();
        assert!(conn.is_closed());

        // Output queued after close is dropped.
        conn.enqueue(Bytes::from_static(&[0, 0, 0, 0]));
        assert_eq!(conn.write_pending().unwrap(), WriteState::Drained);
    }
}
