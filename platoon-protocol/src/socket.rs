//! TCP plumbing for vehicle links: framed reader/writer halves, a listener
//! that can give up, and connect-with-backoff.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::messages::split_frame;
use crate::{ControlMessage, ProtocolError};

/// Longest sleep between accept polls
const ACCEPT_POLL_MAX: Duration = Duration::from_millis(50);

/// True for the error kinds a read deadline produces.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Write half of a link that can also be torn down.
pub trait Transport: Write + Send {
    /// Shut the underlying stream down in both directions.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

/// Bounded exponential backoff for connection retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.saturating_pow(attempt);
        self.initial.saturating_mul(scale).min(self.max)
    }
}

/// Incremental frame reader.
///
/// Bytes are accumulated across partial reads and read deadlines, so a
/// timeout in the middle of a frame never loses data.
pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            pending: Vec::new(),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the read deadline expired before a frame was
    /// complete. An undecodable frame is consumed and reported as
    /// [`ProtocolError::InvalidPayload`]; the stream stays usable.
    pub fn poll(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        loop {
            if let Some((payload, consumed)) = split_frame(&self.pending)? {
                let result = ControlMessage::from_payload(payload);
                self.pending.drain(..consumed);
                return result.map(Some);
            }

            let mut buf = [0u8; 256];
            match self.inner.read(&mut buf) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(ref e) if is_timeout(e) => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the stream. Buffered partial frames are discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Frame writer. Each message is written and flushed in one call.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    /// Send a message
    pub fn send(&mut self, msg: &ControlMessage) -> Result<(), ProtocolError> {
        msg.write_to(&mut self.inner)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Transport> FrameWriter<W> {
    /// Shut the link down
    pub fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
}

/// A connected vehicle link
pub struct PeerConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl PeerConnection {
    fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(PeerConnection { stream, peer })
    }

    /// Connect once
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_tcp(stream)
    }

    /// Connect, retrying with `backoff` until the remote listener is up.
    ///
    /// With `give_up_after` set, fails with [`io::ErrorKind::TimedOut`] once
    /// that much time has passed.
    pub fn connect_with_backoff(
        addr: SocketAddr,
        backoff: &Backoff,
        give_up_after: Option<Duration>,
    ) -> io::Result<Self> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match Self::connect(addr, backoff.max) {
                Ok(conn) => {
                    debug!("connected to {} after {} attempt(s)", addr, attempt + 1);
                    return Ok(conn);
                }
                Err(e) => {
                    let delay = backoff.delay(attempt);
                    if let Some(limit) = give_up_after {
                        if start.elapsed() + delay > limit {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("{} not reachable after {:?}: {}", addr, limit, e),
                            ));
                        }
                    }
                    debug!("connect to {} failed ({}), retrying in {:?}", addr, e, delay);
                    std::thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Address of the remote end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Split into a reader with the given read deadline and a writer.
    ///
    /// The writer gets a write deadline of its own so a stalled neighbour
    /// surfaces as an error instead of blocking forever.
    pub fn split(
        self,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> io::Result<(FrameReader<TcpStream>, FrameWriter<TcpStream>)> {
        let reader = self.stream.try_clone()?;
        reader.set_read_timeout(Some(read_timeout))?;
        self.stream.set_write_timeout(Some(write_timeout))?;
        Ok((FrameReader::new(reader), FrameWriter::new(self.stream)))
    }
}

/// Listener for the single inbound link from the vehicle behind
pub struct PeerListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl PeerListener {
    /// Bind to a socket address and start listening
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        Ok(PeerListener { listener, addr })
    }

    /// Get the address this listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept one connection, polling every `poll` so that `deadline` can be
    /// honoured. Without a deadline this waits indefinitely.
    pub fn accept_within(
        &self,
        poll: Duration,
        deadline: Option<Duration>,
    ) -> io::Result<PeerConnection> {
        self.listener.set_nonblocking(true)?;
        let start = Instant::now();
        let nap = poll.min(ACCEPT_POLL_MAX);
        loop {
            match self.listener.accept() {
                Ok((stream, from)) => {
                    debug!("accepted link from {}", from);
                    stream.set_nonblocking(false)?;
                    return PeerConnection::from_tcp(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(limit) = deadline {
                        if start.elapsed() >= limit {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("no connection on {} within {:?}", self.addr, limit),
                            ));
                        }
                    }
                    std::thread::sleep(nap);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Reader that hands out at most `chunk` bytes per call
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "drained"));
            }
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_frame_reader_accumulates_partial_reads() {
        let mut data = ControlMessage::Position(1234.5).encode();
        data.extend(ControlMessage::Stop.encode());
        let mut reader = FrameReader::new(Trickle {
            data: &data,
            chunk: 1,
        });

        assert_eq!(reader.poll().unwrap(), Some(ControlMessage::Position(1234.5)));
        assert_eq!(reader.poll().unwrap(), Some(ControlMessage::Stop));
        assert_eq!(reader.poll().unwrap(), None);
    }

    #[test]
    fn test_frame_reader_keeps_partial_frame_across_timeout() {
        let encoded = ControlMessage::Quit.encode();
        let mut reader = FrameReader::new(Trickle {
            data: &encoded[..5],
            chunk: 8,
        });
        assert_eq!(reader.poll().unwrap(), None);

        reader.inner = Trickle {
            data: &encoded[5..],
            chunk: 8,
        };
        assert_eq!(reader.poll().unwrap(), Some(ControlMessage::Quit));
    }

    #[test]
    fn test_frame_reader_skips_invalid_payload() {
        let mut data = 3u32.to_be_bytes().to_vec();
        data.extend(b"\"Z\"");
        data.extend(ControlMessage::Accelerate.encode());
        let mut reader = FrameReader::new(Trickle {
            data: &data,
            chunk: 64,
        });
        assert!(matches!(reader.poll(), Err(ProtocolError::InvalidPayload(_))));
        assert_eq!(reader.poll().unwrap(), Some(ControlMessage::Accelerate));
    }

    #[test]
    fn test_frame_reader_reports_closure() {
        let empty: &[u8] = &[];
        let mut reader = FrameReader::new(empty);
        assert!(matches!(reader.poll(), Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn test_tcp_link_round_trip() {
        let listener = PeerListener::bind(loopback()).unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let conn = listener.accept_within(Duration::from_millis(10), None).unwrap();
            let (mut reader, mut writer) = conn
                .split(Duration::from_millis(20), Duration::from_secs(1))
                .unwrap();
            let msg = loop {
                if let Some(msg) = reader.poll().unwrap() {
                    break msg;
                }
            };
            assert_eq!(msg, ControlMessage::Decelerate);
            writer.send(&ControlMessage::Position(250.0)).unwrap();
        });

        let conn = PeerConnection::connect_with_backoff(addr, &Backoff::default(), None).unwrap();
        let (mut reader, mut writer) = conn
            .split(Duration::from_millis(20), Duration::from_secs(1))
            .unwrap();
        writer.send(&ControlMessage::Decelerate).unwrap();
        let reply = loop {
            if let Some(msg) = reader.poll().unwrap() {
                break msg;
            }
        };
        assert_eq!(reply, ControlMessage::Position(250.0));
        server.join().unwrap();
    }

    #[test]
    fn test_connect_with_backoff_waits_for_listener() {
        // Reserve a port, release it, and only bind it again after a delay
        let addr = TcpListener::bind(loopback()).unwrap().local_addr().unwrap();

        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let listener = PeerListener::bind(addr).unwrap();
            listener
                .accept_within(Duration::from_millis(10), Some(Duration::from_secs(5)))
                .unwrap()
        });

        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            factor: 2,
        };
        let conn =
            PeerConnection::connect_with_backoff(addr, &backoff, Some(Duration::from_secs(5)))
                .unwrap();
        assert_eq!(conn.peer_addr(), addr);
        late.join().unwrap();
    }

    #[test]
    fn test_connect_with_backoff_gives_up() {
        let addr = TcpListener::bind(loopback()).unwrap().local_addr().unwrap();
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(20),
            factor: 2,
        };
        let err = PeerConnection::connect_with_backoff(addr, &backoff, Some(Duration::from_millis(100)))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_accept_within_deadline() {
        let listener = PeerListener::bind(loopback()).unwrap();
        let err = listener
            .accept_within(Duration::from_millis(5), Some(Duration::from_millis(50)))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
