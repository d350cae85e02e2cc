//! UDP discovery. The device answers desktop broadcasts with its TCP port, and can also go
//! looking for a desktop that is listening for devices.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::transport::bind_udp;

/// Content-server port quoted in the descriptive reply. The device runs no content server.
const CONTENT_PORT: u16 = 80;

/// Datagrams handled per socket per drain, so one tick stays bounded under a flood.
const MAX_DATAGRAMS_PER_DRAIN: usize = 16;

/// Probe sent when locating a desktop application.
const LOCATE_PROBE: &[u8] = b"hello";

/// How the device answers a discovery probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStyle {
    /// Bare ASCII decimal TCP port.
    #[default]
    Plain,
    /// `calibre wireless device client (on <ip>);<content-port>,<tcp-port>`
    Descriptive,
}

/// True if a datagram looks like a desktop discovery broadcast.
pub fn is_discovery_probe(datagram: &[u8]) -> bool {
    let text = String::from_utf8_lossy(datagram);
    text.contains("hi there") || text.contains("hello") || text.contains("calibre")
}

/// Reply body for a probe. `local_ip` is the address the peer should connect to.
pub fn reply_text(style: ReplyStyle, tcp_port: u16, local_ip: IpAddr) -> String {
    match style {
        ReplyStyle::Plain => tcp_port.to_string(),
        ReplyStyle::Descriptive => format!(
            "calibre wireless device client (on {local_ip});{CONTENT_PORT},{tcp_port}"
        ),
    }
}

/// Parse a desktop reply of the form `... (on <host>);<content-port>,<tcp-port>`.
/// A bare decimal port is accepted too. Returns (host if present, tcp port).
pub fn parse_server_reply(reply: &str) -> Option<(Option<String>, u16)> {
    let reply = reply.trim();
    if let Ok(port) = reply.parse::<u16>() {
        return (port != 0).then_some((None, port));
    }
    let (head, ports) = reply.rsplit_once(';')?;
    let tcp = ports.rsplit(',').next()?.trim().parse::<u16>().ok()?;
    if tcp == 0 {
        return None;
    }
    let host = head
        .rfind("(on ")
        .and_then(|at| head[at + 4..].split(')').next())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string);
    Some((host, tcp))
}

/// Local address used to reach `peer`. No packet is sent.
pub fn local_ip_towards(peer: IpAddr) -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.connect((peer, 9))?;
        Ok(sock.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

/// The set of bound discovery sockets. Dropping it closes them.
#[derive(Debug)]
pub struct Discovery {
    sockets: Vec<UdpSocket>,
    advertised_port: u16,
    style: ReplyStyle,
}

impl Discovery {
    /// Bind one socket per port. Succeeds if at least one binds.
    pub fn start(ports: &[u16], advertised_port: u16, style: ReplyStyle) -> Result<Self> {
        let mut sockets = Vec::with_capacity(ports.len());
        for &port in ports {
            match bind_udp(port) {
                Ok(s) => sockets.push(s),
                Err(e) => warn!("Discovery port {} unavailable: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(SyncError::Socket(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no discovery port available",
            )));
        }
        info!(
            "Discovery listening on {}/{} ports, advertising TCP port {}",
            sockets.len(),
            ports.len(),
            advertised_port
        );
        Ok(Self {
            sockets,
            advertised_port,
            style,
        })
    }

    pub fn advertised_port(&self) -> u16 {
        self.advertised_port
    }

    /// Actual local ports, useful when some were requested as 0.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .map(|a| a.port())
            .collect()
    }

    /// Answer every pending probe without blocking. Returns the number of replies sent.
    pub fn drain(&mut self) -> usize {
        let mut replies = 0;
        let mut buf = [0u8; 512];
        for socket in &self.sockets {
            for _ in 0..MAX_DATAGRAMS_PER_DRAIN {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("Discovery recv failed: {}", e);
                        break;
                    }
                };
                if !is_discovery_probe(&buf[..n]) {
                    continue;
                }
                let reply = reply_text(self.style, self.advertised_port, local_ip_towards(from.ip()));
                match socket.send_to(reply.as_bytes(), from) {
                    Ok(_) => {
                        info!("Answered discovery from {} with {:?}", from, reply);
                        replies += 1;
                    }
                    Err(e) => warn!("Discovery reply to {} failed: {}", from, e),
                }
            }
        }
        replies
    }
}

/// Broadcast a probe on `ports` and wait for the first desktop reply.
pub fn locate_server(ports: &[u16], timeout: Duration) -> Result<SocketAddr> {
    let targets: Vec<SocketAddr> = ports
        .iter()
        .map(|&p| SocketAddr::from((Ipv4Addr::BROADCAST, p)))
        .collect();
    locate_server_at(&targets, timeout)
}

/// Send a probe to each target and return the address from the first parsable reply.
/// The reply's source IP is used when the reply carries no host.
pub fn locate_server_at(targets: &[SocketAddr], timeout: Duration) -> Result<SocketAddr> {
    let socket = bind_udp(0)?;
    for target in targets {
        if let Err(e) = socket.send_to(LOCATE_PROBE, target) {
            debug!("Probe to {} failed: {}", target, e);
        }
    }
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                match parse_server_reply(&text) {
                    Some((host, port)) => {
                        let ip = host
                            .and_then(|h| h.parse::<IpAddr>().ok())
                            .unwrap_or(from.ip());
                        info!("Located desktop at {}:{}", ip, port);
                        return Ok(SocketAddr::new(ip, port));
                    }
                    None => debug!("Ignoring discovery reply from {}: {:?}", from, text),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(SyncError::Socket(e)),
        }
    }
    Err(SyncError::Timeout)
}
