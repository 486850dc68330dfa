//! Byte transports carrying frames, a TCP one for real connections and an in-memory
//! one for tests and local play.
//!
//! Transports never block longer than the timeout given to each call, so that the
//! connection loop can always observe cancellation.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use mio::{Events, Interest, Poll, Token};
use mio::net::TcpStream;


/// A bidirectional byte stream owned by a connection loop.
pub trait Transport: Send {

    /// Wait at most `timeout` for incoming bytes and append every byte received so
    /// far to `buf`. Returns the number of bytes appended, zero if nothing arrived in
    /// time. The end of the stream is an [`io::ErrorKind::UnexpectedEof`] error, only
    /// returned once every byte before it has been received.
    fn recv(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize>;

    /// Write a prefix of `data`, waiting at most `timeout` for the transport to accept
    /// bytes. Returns the number of bytes written, zero if it is still not writable.
    fn send(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Close the transport, both directions.
    fn close(&mut self) -> io::Result<()>;

}

impl<T: Transport + ?Sized> Transport for Box<T> {

    #[inline]
    fn recv(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        (**self).recv(buf, timeout)
    }

    #[inline]
    fn send(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        (**self).send(data, timeout)
    }

    #[inline]
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

}

/// Send all of `data` before the deadline, returns false if the deadline passed first,
/// in which case a prefix of the data may have been written.
pub fn send_all<T: Transport + ?Sized>(transport: &mut T, mut data: &[u8], deadline: Instant) -> io::Result<bool> {
    while !data.is_empty() {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Ok(false);
        };
        let len = transport.send(data, remaining)?;
        data = &data[len..];
    }
    Ok(true)
}


/// Polling token of the stream in its transport's own poll.
const STREAM_TOKEN: Token = Token(0);
/// Size of the stack buffer used to drain the socket.
const BUF_SIZE: usize = 1024;


/// A transport over a non-blocking TCP stream, registered on its own poll.
pub struct TcpTransport {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    /// Readiness is edge-triggered, these are cleared when an operation would block
    /// and set again by the next poll event.
    readable: bool,
    writable: bool,
}

impl TcpTransport {

    /// Timeout for establishing outgoing connections.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a transport from an already connected stream, as returned by a mio
    /// listener.
    pub fn new(mut stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut stream, STREAM_TOKEN, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(16),
            readable: true,
            writable: true,
        })
    }

    /// Connect to the given address.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect_timeout(&addr, Self::CONNECT_TIMEOUT)?;
        stream.set_nonblocking(true)?;
        Self::new(TcpStream::from_std(stream))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Wait at most `timeout` for readiness events and update the readiness state.
    fn wait(&mut self, timeout: Duration) -> io::Result<()> {

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            res => res?,
        }

        for event in self.events.iter() {
            // Errors and closed sides are reported by the next operation.
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                self.readable = true;
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                self.writable = true;
            }
        }

        Ok(())

    }

}

impl Transport for TcpTransport {

    fn recv(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {

        if !self.readable {
            self.wait(timeout)?;
            if !self.readable {
                return Ok(0);
            }
        }

        let start = buf.len();
        let mut chunk = [0; BUF_SIZE];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) if buf.len() == start => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"));
                }
                // The end of stream is reported by the next call.
                Ok(0) => break,
                Ok(len) => buf.extend_from_slice(&chunk[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(buf.len() - start)

    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {

        if data.is_empty() {
            return Ok(0);
        }

        if !self.writable {
            self.wait(timeout)?;
            if !self.writable {
                return Ok(0);
            }
        }

        loop {
            match self.stream.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(len) => return Ok(len),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

    }

    fn close(&mut self) -> io::Result<()> {
        let _ = self.poll.registry().deregister(&mut self.stream);
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.stream.peer_addr().ok())
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}


/// An in-memory transport, created in connected pairs. Bytes sent by one end are
/// received by the other end, sending never waits.
///
/// It also implements blocking [`Read`] and [`Write`], which are handy for playing
/// the peer of a connection in tests.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    /// Received bytes not yet consumed.
    incoming: VecDeque<u8>,
    /// Set when the peer dropped or closed its end.
    peer_closed: bool,
}

impl MemoryTransport {

    /// Timeout of blocking reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create two connected transports.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            incoming: VecDeque::new(),
            peer_closed: false,
        }
    }

    /// Wait at most `timeout` until some bytes are received, returns true if there are
    /// bytes to consume.
    fn fill(&mut self, timeout: Duration) -> bool {

        loop {
            match self.rx.try_recv() {
                Ok(data) => self.incoming.extend(data),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.peer_closed = true;
                    break;
                }
            }
        }

        if self.incoming.is_empty() && !self.peer_closed {
            match self.rx.recv_timeout(timeout) {
                Ok(data) => self.incoming.extend(data),
                Err(RecvTimeoutError::Disconnected) => self.peer_closed = true,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        !self.incoming.is_empty()

    }

}

impl Transport for MemoryTransport {

    fn recv(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        if !self.fill(timeout) {
            return if self.peer_closed {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "memory transport closed by peer"))
            } else {
                Ok(0)
            };
        }
        let len = self.incoming.len();
        buf.extend(self.incoming.drain(..));
        Ok(len)
    }

    fn send(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        let Some(tx) = &self.tx else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        if !data.is_empty() {
            tx.send(data.to_vec()).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }
        Ok(data.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }

}

impl Read for MemoryTransport {

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {

        if buf.is_empty() {
            return Ok(0);
        }

        if !self.fill(Self::READ_TIMEOUT) {
            return if self.peer_closed {
                Ok(0)
            } else {
                Err(io::Error::new(io::ErrorKind::TimedOut, "memory transport read timed out"))
            };
        }

        let len = buf.len().min(self.incoming.len());
        for (dst, src) in buf.iter_mut().zip(self.incoming.drain(..len)) {
            *dst = src;
        }
        Ok(len)

    }

}

impl Write for MemoryTransport {

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf, Duration::ZERO)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

}
