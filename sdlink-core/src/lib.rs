//! Calibre smart-device wireless sync engine.
//! Host-driven: the host owns the loop and calls `SyncContext::poll`; the engine never spawns threads.

pub mod auth;
pub mod buffer;
pub mod callbacks;
pub mod config;
pub mod discovery;
pub mod error;
mod handlers;
pub mod json;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod transport;
pub mod validate;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use callbacks::Callbacks;
pub use config::DeviceConfig;
pub use discovery::{locate_server, parse_server_reply, ReplyStyle};
pub use error::{ErrorKind, Result, SyncError, ValidationError};
pub use protocol::{Opcode, Vocabulary, BROADCAST_PORTS, DEFAULT_PORT, PROTOCOL_VERSION};
pub use session::{ConnectionPhase, LibraryInfo, Role, SyncContext, Tick};
pub use storage::{FsStorage, Storage};
pub use transfer::{BookMeta, TransferMode};
pub use transport::CancelHandle;
