//! Connection context: the single object a host drives. Owns the discovery sockets, an
//! optional listener, at most one desktop connection, and everything the handlers need.
//!
//! The host calls [`SyncContext::poll`] in a loop. Each call answers pending discovery probes,
//! accepts a waiting desktop when listening, and handles at most one message. A SEND_BOOK is
//! handled to completion inside that call.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::buffer::RecvBuffer;
use crate::callbacks::Callbacks;
use crate::config::DeviceConfig;
use crate::discovery::{self, Discovery};
use crate::error::{Result, SyncError};
use crate::handlers;
use crate::protocol::OpcodeToken;
use crate::storage::Storage;
use crate::transport::{bind_listener, CancelHandle, TcpLink};

/// Upper bound on how long `poll` idles when there is no connection to wait on.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Observable connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No sockets open.
    Idle,
    /// Waiting to be found or connected to.
    Discovery,
    /// Connected, GET_INITIALIZATION_INFO not yet answered.
    Handshake,
    Connected,
    /// A SEND_BOOK is being received. The transfer runs to completion inside one `poll`, so
    /// callers never observe this phase from `SyncContext::phase`; the progress callback is how a
    /// transfer in progress is seen from outside.
    ReceivingBook,
}

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The device dialled the desktop application.
    Client,
    /// The desktop application connected to the device's listener.
    Server,
}

/// Library identity announced by the desktop application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryInfo {
    pub name: Option<String>,
    pub uuid: Option<String>,
}

/// Result of one `poll`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tick {
    pub discovery_replies: usize,
    pub accepted: Option<SocketAddr>,
    /// Opcode of the message handled this tick, if any.
    pub handled: Option<OpcodeToken>,
}

/// State that outlives a single connection.
pub(crate) struct Device {
    pub config: DeviceConfig,
    pub storage: Box<dyn Storage>,
    pub callbacks: Callbacks,
    pub cancel: CancelHandle,
    pub store_uuid: String,
    pub library: LibraryInfo,
    pub desktop_name: Option<String>,
    pub desktop_info: Option<String>,
    pub books_received: u64,
}

impl Device {
    pub fn new(config: DeviceConfig, storage: Box<dyn Storage>, callbacks: Callbacks) -> Self {
        let store_uuid = config
            .store_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            config,
            storage,
            callbacks,
            cancel: CancelHandle::new(),
            store_uuid,
            library: LibraryInfo::default(),
            desktop_name: None,
            desktop_info: None,
            books_received: 0,
        }
    }
}

/// One desktop connection.
pub(crate) struct Peer<S> {
    pub stream: S,
    pub rx: RecvBuffer,
    pub role: Role,
    pub phase: ConnectionPhase,
    /// Used for the password hash when the desktop sends no challenge.
    pub challenge: String,
    /// Set when a failed exchange may have left unread bytes on the stream.
    pub desynced: bool,
}

impl<S> Peer<S> {
    pub fn new(stream: S, role: Role) -> Self {
        Self {
            stream,
            rx: RecvBuffer::new(),
            role,
            phase: ConnectionPhase::Handshake,
            challenge: auth::new_challenge(),
            desynced: false,
        }
    }
}

pub struct SyncContext {
    device: Device,
    discovery: Option<Discovery>,
    listener: Option<TcpListener>,
    peer: Option<Peer<TcpLink>>,
    last_error: Option<String>,
}

impl SyncContext {
    pub fn new(
        config: DeviceConfig,
        storage: impl Storage + 'static,
        callbacks: Callbacks,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            device: Device::new(config, Box::new(storage), callbacks),
            discovery: None,
            listener: None,
            peer: None,
            last_error: None,
        })
    }

    /// Answer discovery probes with `advertised_port`. Restarting with the same port is a no-op.
    pub fn start_discovery(&mut self, advertised_port: u16) -> Result<()> {
        if let Some(d) = &self.discovery {
            if d.advertised_port() == advertised_port {
                return Ok(());
            }
        }
        self.discovery = None;
        let cfg = &self.device.config;
        let started = Discovery::start(&cfg.discovery_ports, advertised_port, cfg.discovery_reply);
        self.discovery = Some(self.record(started)?);
        Ok(())
    }

    pub fn stop_discovery(&mut self) {
        if self.discovery.take().is_some() {
            info!("Discovery stopped");
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }

    /// Local UDP ports discovery is bound to.
    pub fn discovery_ports(&self) -> Vec<u16> {
        self.discovery
            .as_ref()
            .map(Discovery::bound_ports)
            .unwrap_or_default()
    }

    /// Accept desktop connections on `port` (0 picks one). Returns the bound port.
    pub fn listen(&mut self, port: u16) -> Result<u16> {
        let bound = bind_listener(port).and_then(|l| Ok((l.local_addr()?.port(), l)));
        let (port, listener) = self.record(bound)?;
        info!("Listening for the desktop on TCP port {}", port);
        self.listener = Some(listener);
        Ok(port)
    }

    pub fn stop_listening(&mut self) {
        self.listener = None;
    }

    /// Connect to a desktop application. Any existing connection is closed first.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.disconnect();
        self.device.cancel.reset();
        let cfg = &self.device.config;
        let link = TcpLink::connect(
            host,
            port,
            cfg.connect_timeout(),
            cfg.io_timeout(),
            self.device.cancel.clone(),
        );
        let link = self.record(link)?;
        info!("Connected to desktop at {}", link.peer_addr());
        self.peer = Some(Peer::new(link, Role::Client));
        Ok(())
    }

    /// Broadcast for a desktop application and connect to the first one that answers.
    pub fn connect_discovered(&mut self, timeout: Duration) -> Result<SocketAddr> {
        let found = discovery::locate_server(&self.device.config.discovery_ports, timeout);
        let addr = self.record(found)?;
        self.connect(&addr.ip().to_string(), addr.port())?;
        Ok(addr)
    }

    pub fn disconnect(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.stream.shutdown();
            info!("Disconnected from {}", peer.stream.peer_addr());
        }
    }

    /// Run one cooperative step. Waits at most `timeout` for a message, plus the time needed to
    /// handle it. Link-level failures close the connection before the error is returned.
    pub fn poll(&mut self, timeout: Duration) -> Result<Tick> {
        let mut tick = Tick::default();
        if let Some(d) = self.discovery.as_mut() {
            tick.discovery_replies = d.drain();
        }
        tick.accepted = self.accept_pending();

        let outcome = match self.peer.as_mut() {
            None => None,
            Some(peer) => Some(Self::service(&mut self.device, peer, timeout)),
        };
        match outcome {
            None => {
                if tick.discovery_replies == 0 && tick.accepted.is_none() {
                    std::thread::sleep(timeout.min(IDLE_WAIT));
                }
                Ok(tick)
            }
            Some(Ok(handled)) => {
                tick.handled = handled;
                Ok(tick)
            }
            Some(Err(e)) => Err(self.fail(e)),
        }
    }

    fn service(
        device: &mut Device,
        peer: &mut Peer<TcpLink>,
        timeout: Duration,
    ) -> Result<Option<OpcodeToken>> {
        if !peer.stream.wait_readable(timeout)? {
            return Ok(None);
        }
        handlers::process_one(device, peer).map(Some)
    }

    fn accept_pending(&mut self) -> Option<SocketAddr> {
        let listener = self.listener.as_ref()?;
        let (stream, addr) = match listener.accept() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                warn!("Accept failed: {}", e);
                return None;
            }
        };
        if self.peer.is_some() {
            warn!("Refusing {}: a desktop is already connected", addr);
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }
        self.device.cancel.reset();
        let link = TcpLink::from_stream(stream, self.device.config.io_timeout(), self.device.cancel.clone());
        match link {
            Ok(link) => {
                info!("Desktop connected from {}", addr);
                self.peer = Some(Peer::new(link, Role::Server));
                Some(addr)
            }
            Err(e) => {
                warn!("Could not set up connection from {}: {}", addr, e);
                None
            }
        }
    }

    /// Record `e`, dropping the connection when the stream can no longer be trusted.
    fn fail(&mut self, e: SyncError) -> SyncError {
        let desynced = self.peer.as_ref().is_some_and(|p| p.desynced);
        if e.is_fatal_to_link() || desynced || matches!(e, SyncError::Cancelled) {
            error!("Connection lost: {}", e);
            self.disconnect();
        } else {
            warn!("{}", e);
        }
        self.last_error = Some(e.to_string());
        e
    }

    fn record<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            error!("{}", e);
            self.last_error = Some(e.to_string());
        }
        r
    }

    pub fn phase(&self) -> ConnectionPhase {
        match &self.peer {
            Some(p) => p.phase,
            None if self.discovery.is_some() || self.listener.is_some() => ConnectionPhase::Discovery,
            None => ConnectionPhase::Idle,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().map(|p| p.stream.peer_addr())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.device.config
    }

    /// Replace the configuration between sessions. Running discovery is restarted on the new ports.
    pub fn reconfigure(&mut self, config: DeviceConfig) -> Result<()> {
        if self.peer.is_some() {
            return Err(SyncError::Busy);
        }
        config.validate()?;
        if let Some(uuid) = &config.store_uuid {
            self.device.store_uuid = uuid.clone();
        }
        self.device.config = config;
        if let Some(port) = self.discovery.take().map(|d| d.advertised_port()) {
            self.start_discovery(port)?;
        }
        Ok(())
    }

    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        self.device.callbacks = callbacks;
    }

    /// Flag that aborts a running transfer or blocking read. Cancelling ends the connection.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.device.cancel.clone()
    }

    pub fn library(&self) -> &LibraryInfo {
        &self.device.library
    }

    /// Name the desktop application gave this device, if any.
    pub fn desktop_name(&self) -> Option<&str> {
        self.device.desktop_name.as_deref()
    }

    /// Raw SET_CALIBRE_DEVICE_INFO payload from the desktop application, if it sent one.
    pub fn desktop_info(&self) -> Option<&str> {
        self.device.desktop_info.as_deref()
    }

    pub fn store_uuid(&self) -> &str {
        &self.device.store_uuid
    }

    pub fn books_received(&self) -> u64 {
        self.device.books_received
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Close every socket. The context can be started again afterwards.
    pub fn shutdown(&mut self) {
        self.disconnect();
        self.stop_listening();
        self.stop_discovery();
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
