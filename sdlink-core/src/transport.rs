//! Socket transport: one TCP link with exact-length send/receive under deadlines, plus helpers
//! for the UDP discovery sockets. No call blocks without a bound.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Upper bound on one blocking read inside `recv_exact`, so cancellation is seen promptly.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared between the engine and whoever drives it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Byte-exact duplex stream. The framer and transfer engine only talk to this.
pub trait ByteStream {
    /// Write all of `bytes` or fail.
    fn send_exact(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fill all of `buf` within `timeout` or fail with Timeout / Disconnected / Cancelled.
    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Resolve `host`: literal IP first, DNS otherwise. IPv4 results are preferred.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SyncError::ConnectFailed(format!("DNS resolution failed for {host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SyncError::ConnectFailed(format!("no address for {host}")))
}

/// The single TCP connection to the desktop application.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    io_timeout: Duration,
    cancel: CancelHandle,
}

impl TcpLink {
    /// Connect with `connect_timeout`, then switch to the steady-state `io_timeout`.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
        cancel: CancelHandle,
    ) -> Result<Self> {
        let addr = resolve(host, port)?;
        info!("Connecting to {}", addr);
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| SyncError::ConnectFailed(format!("{addr}: {e}")))?;
        Self::from_stream(stream, io_timeout, cancel)
            .map_err(|e| SyncError::ConnectFailed(format!("{addr}: {e}")))
    }

    /// Wrap an already-established stream (e.g. from `accept`).
    pub fn from_stream(stream: TcpStream, io_timeout: Duration, cancel: CancelHandle) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        Ok(Self {
            stream,
            peer,
            io_timeout,
            cancel,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wait up to `timeout` for at least one readable byte without consuming it.
    /// Returns Ok(false) if nothing arrived, Err(Disconnected) if the peer closed.
    pub fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut probe = [0u8; 1];
        let result = self.stream.peek(&mut probe);
        self.stream.set_read_timeout(Some(self.io_timeout))?;
        match result {
            Ok(0) => Err(SyncError::Disconnected),
            Ok(_) => Ok(true),
            Err(e) if is_retry(&e) => Ok(false),
            Err(e) if is_disconnect(&e) => Err(SyncError::Disconnected),
            Err(e) => Err(SyncError::Socket(e)),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl ByteStream for TcpLink {
    fn send_exact(&mut self, bytes: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.io_timeout;
        let mut sent = 0;
        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]) {
                Ok(0) => return Err(SyncError::Disconnected),
                Ok(n) => sent += n,
                Err(e) if is_retry(&e) => {
                    if Instant::now() >= deadline {
                        return Err(SyncError::Timeout);
                    }
                }
                Err(e) if is_disconnect(&e) => return Err(SyncError::Disconnected),
                Err(e) => return Err(SyncError::Socket(e)),
            }
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::Timeout);
            }
            let wait = (deadline - now).min(READ_SLICE).max(Duration::from_millis(1));
            self.stream.set_read_timeout(Some(wait))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(SyncError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if is_retry(&e) => continue,
                Err(e) if is_disconnect(&e) => return Err(SyncError::Disconnected),
                Err(e) => return Err(SyncError::Socket(e)),
            }
        }
        Ok(())
    }
}

/// Non-blocking TCP listener for the role where the desktop application connects to us.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Non-blocking, address-reusing, broadcast-capable UDP socket on `port`.
pub fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    debug!("UDP socket bound on port {}", port);
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair() -> (TcpLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = TcpLink::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_secs(2),
            CancelHandle::new(),
        )
        .unwrap();
        let (peer, _) = listener.accept().unwrap();
        (link, peer)
    }

    #[test]
    fn resolve_literal_ip() {
        let addr = resolve("127.0.0.1", 9090).unwrap();
        assert_eq!(addr, "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn connect_refused_is_connect_failed() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TcpLink::connect(
            "127.0.0.1",
            port,
            Duration::from_millis(500),
            Duration::from_secs(1),
            CancelHandle::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::ConnectFailed(_)));
    }

    #[test]
    fn recv_exact_assembles_partial_writes() {
        let (mut link, mut peer) = pair();
        let writer = thread::spawn(move || {
            for piece in [&b"he"[..], b"ll", b"o"] {
                peer.write_all(piece).unwrap();
                peer.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            peer
        });
        let mut buf = [0u8; 5];
        link.recv_exact(&mut buf, Duration::from_secs(2)).unwrap();
        assert_eq!(&buf, b"hello");
        let _ = writer.join();
    }

    #[test]
    fn recv_exact_times_out() {
        let (mut link, _peer) = pair();
        let mut buf = [0u8; 4];
        let started = Instant::now();
        let err = link
            .recv_exact(&mut buf, Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn recv_exact_reports_disconnect() {
        let (mut link, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 4];
        let err = link.recv_exact(&mut buf, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncError::Disconnected));
    }

    #[test]
    fn recv_exact_observes_cancel_mid_wait() {
        let (mut link, _peer) = pair();
        let cancel = link.cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            cancel.cancel();
        });
        let mut buf = [0u8; 4];
        let started = Instant::now();
        let err = link.recv_exact(&mut buf, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();
    }

    #[test]
    fn wait_readable_does_not_consume() {
        let (mut link, mut peer) = pair();
        assert!(!link.wait_readable(Duration::from_millis(20)).unwrap());
        peer.write_all(b"x").unwrap();
        assert!(link.wait_readable(Duration::from_secs(1)).unwrap());
        let mut buf = [0u8; 1];
        link.recv_exact(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn send_exact_delivers_everything() {
        let (mut link, mut peer) = pair();
        let payload = vec![7u8; 256 * 1024];
        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            peer.read_to_end(&mut got).unwrap();
            got
        });
        link.send_exact(&payload).unwrap();
        link.shutdown();
        assert_eq!(reader.join().unwrap(), payload);
    }
}
